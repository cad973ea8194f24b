//! ALSA 采集设备
//!
//! 直接调用 libasound，只覆盖 relay 需要的部分：
//! - 以交织 RW 方式打开采集流，设置格式 / 声道 / 采样率
//! - 周期约 100ms，设备缓冲区约 5 个周期
//! - `snd_pcm_readi` 阻塞读，`-EPIPE` 映射为数据丢失，`snd_pcm_prepare` 恢复

use std::ffi::{c_void, CStr, CString};
use std::os::raw::{c_char, c_int, c_long, c_uint, c_ulong};
use std::ptr;

use super::{check_period_fits, CaptureDevice, ReadError};
use crate::audio::CaptureFormat;

#[allow(non_camel_case_types)]
type snd_pcm_t = c_void;
#[allow(non_camel_case_types)]
type snd_pcm_hw_params_t = c_void;
#[allow(non_camel_case_types)]
type snd_pcm_uframes_t = c_ulong;
#[allow(non_camel_case_types)]
type snd_pcm_sframes_t = c_long;

const SND_PCM_STREAM_CAPTURE: c_int = 1;
const SND_PCM_ACCESS_RW_INTERLEAVED: c_int = 3;

/// 默认周期：1/10 秒（微秒）
const DEFAULT_PERIOD_US: c_uint = 100_000;
/// 默认缓冲区：5 个周期
const DEFAULT_BUFFER_PERIODS: c_uint = 5;

#[link(name = "asound")]
extern "C" {
    fn snd_pcm_open(
        pcm: *mut *mut snd_pcm_t,
        name: *const c_char,
        stream: c_int,
        mode: c_int,
    ) -> c_int;
    fn snd_pcm_close(pcm: *mut snd_pcm_t) -> c_int;
    fn snd_pcm_drain(pcm: *mut snd_pcm_t) -> c_int;
    fn snd_pcm_prepare(pcm: *mut snd_pcm_t) -> c_int;
    fn snd_pcm_readi(
        pcm: *mut snd_pcm_t,
        buffer: *mut c_void,
        size: snd_pcm_uframes_t,
    ) -> snd_pcm_sframes_t;
    fn snd_strerror(errnum: c_int) -> *const c_char;

    fn snd_pcm_hw_params_malloc(params: *mut *mut snd_pcm_hw_params_t) -> c_int;
    fn snd_pcm_hw_params_free(params: *mut snd_pcm_hw_params_t);
    fn snd_pcm_hw_params_any(pcm: *mut snd_pcm_t, params: *mut snd_pcm_hw_params_t) -> c_int;
    fn snd_pcm_hw_params_set_access(
        pcm: *mut snd_pcm_t,
        params: *mut snd_pcm_hw_params_t,
        access: c_int,
    ) -> c_int;
    fn snd_pcm_hw_params_set_format(
        pcm: *mut snd_pcm_t,
        params: *mut snd_pcm_hw_params_t,
        format: c_int,
    ) -> c_int;
    fn snd_pcm_hw_params_set_channels(
        pcm: *mut snd_pcm_t,
        params: *mut snd_pcm_hw_params_t,
        channels: c_uint,
    ) -> c_int;
    fn snd_pcm_hw_params_set_rate(
        pcm: *mut snd_pcm_t,
        params: *mut snd_pcm_hw_params_t,
        rate: c_uint,
        dir: c_int,
    ) -> c_int;
    fn snd_pcm_hw_params_set_period_time_near(
        pcm: *mut snd_pcm_t,
        params: *mut snd_pcm_hw_params_t,
        val: *mut c_uint,
        dir: *mut c_int,
    ) -> c_int;
    fn snd_pcm_hw_params_set_buffer_time_near(
        pcm: *mut snd_pcm_t,
        params: *mut snd_pcm_hw_params_t,
        val: *mut c_uint,
        dir: *mut c_int,
    ) -> c_int;
    fn snd_pcm_hw_params_get_period_size(
        params: *const snd_pcm_hw_params_t,
        frames: *mut snd_pcm_uframes_t,
        dir: *mut c_int,
    ) -> c_int;
    fn snd_pcm_hw_params(pcm: *mut snd_pcm_t, params: *mut snd_pcm_hw_params_t) -> c_int;
}

/// ALSA 错误
#[derive(Debug, thiserror::Error)]
pub enum AlsaError {
    #[error("invalid device name: {0}")]
    InvalidName(String),
    #[error("could not open ALSA device {device}: {reason}")]
    Open { device: String, reason: String },
    #[error("could not {what}: {reason}")]
    Params { what: &'static str, reason: String },
}

fn strerror(code: c_int) -> String {
    unsafe {
        let msg = snd_strerror(code);
        if msg.is_null() {
            format!("error {}", code)
        } else {
            CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    }
}

fn check(what: &'static str, code: c_int) -> Result<(), AlsaError> {
    if code < 0 {
        Err(AlsaError::Params {
            what,
            reason: strerror(code),
        })
    } else {
        Ok(())
    }
}

/// hw_params 的 RAII 守卫
struct HwParams(*mut snd_pcm_hw_params_t);

impl Drop for HwParams {
    fn drop(&mut self) {
        unsafe { snd_pcm_hw_params_free(self.0) }
    }
}

/// ALSA 采集设备
pub struct AlsaCapture {
    pcm: *mut snd_pcm_t,
    name: String,
    format: CaptureFormat,
    period_frames: usize,
}

// snd_pcm_t 句柄只在持有者线程使用
unsafe impl Send for AlsaCapture {}

impl AlsaCapture {
    /// 打开并配置采集设备
    pub fn open(name: &str, format: CaptureFormat) -> Result<Self, AlsaError> {
        let c_name = CString::new(name).map_err(|_| AlsaError::InvalidName(name.to_string()))?;

        let mut pcm: *mut snd_pcm_t = ptr::null_mut();
        let ret = unsafe { snd_pcm_open(&mut pcm, c_name.as_ptr(), SND_PCM_STREAM_CAPTURE, 0) };
        if ret < 0 {
            return Err(AlsaError::Open {
                device: name.to_string(),
                reason: strerror(ret),
            });
        }

        // 后续任何失败都由 Drop 关闭句柄
        let mut device = Self {
            pcm,
            name: name.to_string(),
            format,
            period_frames: 0,
        };
        device.period_frames = device.configure()?;

        log::info!(
            "ALSA capture {} opened: {}, {} frames/period",
            device.name,
            device.format,
            device.period_frames
        );

        Ok(device)
    }

    fn configure(&mut self) -> Result<usize, AlsaError> {
        let pcm = self.pcm;
        unsafe {
            let mut raw: *mut snd_pcm_hw_params_t = ptr::null_mut();
            check("alloc hw params", snd_pcm_hw_params_malloc(&mut raw))?;
            let params = HwParams(raw);

            check("set default hw params", snd_pcm_hw_params_any(pcm, params.0))?;
            check(
                "set access params",
                snd_pcm_hw_params_set_access(pcm, params.0, SND_PCM_ACCESS_RW_INTERLEAVED),
            )?;
            check(
                "set format params",
                snd_pcm_hw_params_set_format(pcm, params.0, self.format.sample_format as c_int),
            )?;
            check(
                "set channels params",
                snd_pcm_hw_params_set_channels(pcm, params.0, c_uint::from(self.format.channels)),
            )?;
            check(
                "set rate params",
                snd_pcm_hw_params_set_rate(pcm, params.0, self.format.rate, 0),
            )?;

            let mut period_us = DEFAULT_PERIOD_US;
            check(
                "set period size",
                snd_pcm_hw_params_set_period_time_near(
                    pcm,
                    params.0,
                    &mut period_us,
                    ptr::null_mut(),
                ),
            )?;
            let mut buffer_us = period_us * DEFAULT_BUFFER_PERIODS;
            check(
                "set buffer size",
                snd_pcm_hw_params_set_buffer_time_near(
                    pcm,
                    params.0,
                    &mut buffer_us,
                    ptr::null_mut(),
                ),
            )?;
            check("set hw params", snd_pcm_hw_params(pcm, params.0))?;

            let mut frames: snd_pcm_uframes_t = 0;
            check(
                "get period size",
                snd_pcm_hw_params_get_period_size(params.0, &mut frames, ptr::null_mut()),
            )?;
            log::debug!(
                "ALSA period {}us, buffer {}us, {} frames/period",
                period_us,
                buffer_us,
                frames
            );
            Ok(frames as usize)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> CaptureFormat {
        self.format
    }

    /// 协商后的每周期帧数
    pub fn period_frames(&self) -> usize {
        self.period_frames
    }

    /// 一个周期的字节数（relay 的块大小）
    pub fn period_bytes(&self) -> usize {
        self.format.period_bytes(self.period_frames)
    }
}

impl CaptureDevice for AlsaCapture {
    fn read_period(&mut self, dest: &mut [u8], frames: usize) -> Result<usize, ReadError> {
        let frame_bytes = self.format.bytes_per_frame();
        check_period_fits(dest, frames, frame_bytes)?;

        // 短读时继续读满，块永远是完整的一个周期
        let mut done = 0usize;
        while done < frames {
            let ret = unsafe {
                snd_pcm_readi(
                    self.pcm,
                    dest[done * frame_bytes..].as_mut_ptr() as *mut c_void,
                    (frames - done) as snd_pcm_uframes_t,
                )
            };
            if ret == -(libc::EPIPE as snd_pcm_sframes_t)
                || ret == -(libc::ESTRPIPE as snd_pcm_sframes_t)
            {
                return Err(ReadError::DataLoss);
            } else if ret == -(libc::EINTR as snd_pcm_sframes_t) {
                continue;
            } else if ret < 0 {
                return Err(ReadError::Fatal(format!(
                    "snd_pcm_readi: {}",
                    strerror(ret as c_int)
                )));
            }
            done += ret as usize;
        }
        Ok(done)
    }

    fn recover(&mut self) -> Result<(), ReadError> {
        let ret = unsafe { snd_pcm_prepare(self.pcm) };
        if ret < 0 {
            return Err(ReadError::Fatal(format!("snd_pcm_prepare: {}", strerror(ret))));
        }
        Ok(())
    }
}

impl Drop for AlsaCapture {
    fn drop(&mut self) {
        if !self.pcm.is_null() {
            unsafe {
                snd_pcm_drain(self.pcm);
                snd_pcm_close(self.pcm);
            }
            self.pcm = ptr::null_mut();
            log::debug!("ALSA capture {} closed", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SampleFormat;

    #[test]
    fn test_open_nonexistent_device_fails() {
        let format = CaptureFormat::new(1, 44100, SampleFormat::S16Le).unwrap();
        assert!(AlsaCapture::open("nonexistent", format).is_err());
    }

    #[test]
    fn test_rejects_interior_nul() {
        let format = CaptureFormat::new(1, 44100, SampleFormat::S16Le).unwrap();
        assert!(matches!(
            AlsaCapture::open("hw\0:0", format),
            Err(AlsaError::InvalidName(_))
        ));
    }

    #[test]
    #[ignore] // 需要 ALSA "null" 插件
    fn test_null_device_reads_one_period() {
        let format = CaptureFormat::new(1, 44100, SampleFormat::S32Le).unwrap();
        let mut device = AlsaCapture::open("null", format).unwrap();
        let frames = device.period_frames();
        let mut buf = vec![0u8; device.period_bytes()];
        assert_eq!(device.read_period(&mut buf, frames), Ok(frames));
    }
}
