//! CPAL device capture.
//!
//! A `cpal::Stream` cannot leave the thread that built it, so every device gets its own OS
//! thread that owns the stream for its whole life. [`DeviceCapture`] talks to that thread
//! over a command channel and waits for each command to be acknowledged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SizedSample, Stream, StreamConfig as CpalStreamConfig};
use ringbuf::traits::{Producer, Split};
use ringbuf::{HeapProd, HeapRb};

use super::{ring_capacity, CaptureSource, OpenedSource};
use crate::format::{i16_to_f32, u16_to_f32};
use crate::{PcmFormat, StreamRelayError};

type CommandResult = Result<(), StreamRelayError>;

/// Which device to open.
#[derive(Debug, Clone)]
pub(crate) enum Selector {
    DefaultInput,
    Named(String),
    Loopback,
}

enum CaptureCommand {
    Play { response: Sender<CommandResult> },
    Pause { response: Sender<CommandResult> },
    Shutdown,
}

/// What the capture thread reports back once the stream is built.
struct Ready {
    name: String,
    format: PcmFormat,
    samples: ringbuf::HeapCons<f32>,
}

/// A cpal input stream hosted on a dedicated thread.
pub struct DeviceCapture {
    name: String,
    format: PcmFormat,
    command_tx: Sender<CaptureCommand>,
    dropped: Arc<AtomicU64>,
}

impl DeviceCapture {
    pub(crate) fn open(
        selector: Selector,
        buffer_duration: Duration,
    ) -> Result<OpenedSource, StreamRelayError> {
        let (command_tx, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let dropped = Arc::new(AtomicU64::new(0));
        let thread_dropped = Arc::clone(&dropped);

        thread::Builder::new()
            .name("stream-relay-capture".to_string())
            .spawn(move || {
                capture_thread(selector, buffer_duration, thread_dropped, ready_tx, command_rx);
            })
            .map_err(|e| StreamRelayError::CaptureThread(e.to_string()))?;

        let ready = ready_rx
            .recv()
            .map_err(|_| StreamRelayError::CaptureThread("exited during setup".to_string()))??;

        tracing::info!(
            device = %ready.name,
            sample_rate = ready.format.sample_rate,
            channels = ready.format.channels,
            "capture device opened"
        );

        Ok(OpenedSource {
            source: Box::new(Self {
                name: ready.name,
                format: ready.format,
                command_tx,
                dropped,
            }),
            samples: ready.samples,
        })
    }

    fn request(
        &self,
        command: impl FnOnce(Sender<CommandResult>) -> CaptureCommand,
    ) -> CommandResult {
        let (response_tx, response_rx) = mpsc::channel();
        self.command_tx
            .send(command(response_tx))
            .map_err(|_| StreamRelayError::CaptureThread("not responding".to_string()))?;
        response_rx
            .recv()
            .map_err(|_| StreamRelayError::CaptureThread("no response".to_string()))?
    }
}

impl CaptureSource for DeviceCapture {
    fn name(&self) -> &str {
        &self.name
    }

    fn format(&self) -> PcmFormat {
        self.format
    }

    fn start(&self) -> Result<(), StreamRelayError> {
        self.request(|response| CaptureCommand::Play { response })
    }

    fn stop(&self) -> Result<(), StreamRelayError> {
        self.request(|response| CaptureCommand::Pause { response })
    }

    fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for DeviceCapture {
    fn drop(&mut self) {
        let _ = self.command_tx.send(CaptureCommand::Shutdown);
    }
}

/// Owns the stream. Exits on `Shutdown` or when the handle is dropped.
fn capture_thread(
    selector: Selector,
    buffer_duration: Duration,
    dropped: Arc<AtomicU64>,
    ready_tx: Sender<Result<Ready, StreamRelayError>>,
    command_rx: Receiver<CaptureCommand>,
) {
    let stream = match build(&selector, buffer_duration, dropped) {
        Ok((stream, ready)) => {
            let _ = ready_tx.send(Ok(ready));
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    while let Ok(command) = command_rx.recv() {
        match command {
            CaptureCommand::Play { response } => {
                let result = stream
                    .play()
                    .map_err(|e| StreamRelayError::BackendError(e.to_string()));
                let _ = response.send(result);
            }
            CaptureCommand::Pause { response } => {
                let result = stream
                    .pause()
                    .map_err(|e| StreamRelayError::BackendError(e.to_string()));
                let _ = response.send(result);
            }
            CaptureCommand::Shutdown => break,
        }
    }

    tracing::debug!("capture thread exiting");
}

fn build(
    selector: &Selector,
    buffer_duration: Duration,
    dropped: Arc<AtomicU64>,
) -> Result<(Stream, Ready), StreamRelayError> {
    let host = cpal::default_host();
    let device = match selector {
        Selector::DefaultInput => host
            .default_input_device()
            .ok_or(StreamRelayError::NoDefaultDevice)?,
        Selector::Named(name) => find_input_device(&host, name)?,
        Selector::Loopback => host
            .default_output_device()
            .ok_or(StreamRelayError::NoDefaultOutputDevice)?,
    };

    // Loopback capture opens an input stream on the output device with its output config
    let supported_config = match selector {
        Selector::Loopback => device.default_output_config(),
        _ => device.default_input_config(),
    }
    .map_err(|e| StreamRelayError::BackendError(e.to_string()))?;

    let sample_format = supported_config.sample_format();
    let cpal_config: CpalStreamConfig = supported_config.into();
    let format = PcmFormat::new(cpal_config.sample_rate.0, cpal_config.channels);

    let ring_buffer = HeapRb::<f32>::new(ring_capacity(format, buffer_duration));
    let (producer, samples) = ring_buffer.split();

    let stream = match sample_format {
        SampleFormat::F32 => build_stream(&device, &cpal_config, producer, dropped, |s: f32| s)?,
        SampleFormat::I16 => build_stream(&device, &cpal_config, producer, dropped, i16_to_f32)?,
        SampleFormat::U16 => build_stream(&device, &cpal_config, producer, dropped, u16_to_f32)?,
        format => {
            return Err(StreamRelayError::UnsupportedFormat {
                format: format!("{format:?}"),
            });
        }
    };

    // Some hosts start streams on creation; sources open paused
    if let Err(e) = stream.pause() {
        tracing::debug!("could not pause new stream: {e}");
    }

    let mut name = device.name().unwrap_or_else(|_| "unknown".to_string());
    if matches!(selector, Selector::Loopback) {
        name.push_str(" (loopback)");
    }

    Ok((
        stream,
        Ready {
            name,
            format,
            samples,
        },
    ))
}

fn find_input_device(host: &cpal::Host, name: &str) -> Result<Device, StreamRelayError> {
    let devices = host
        .input_devices()
        .map_err(|e| StreamRelayError::BackendError(e.to_string()))?;

    for device in devices {
        if device.name().is_ok_and(|device_name| device_name == name) {
            return Ok(device);
        }
    }

    Err(StreamRelayError::DeviceNotFound {
        name: name.to_string(),
    })
}

fn build_stream<T, F>(
    device: &Device,
    config: &CpalStreamConfig,
    mut producer: HeapProd<f32>,
    dropped: Arc<AtomicU64>,
    convert: F,
) -> Result<Stream, StreamRelayError>
where
    T: SizedSample,
    F: Fn(T) -> f32 + Send + 'static,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                // Non-blocking push - drops samples if buffer is full
                let pushed = producer.push_iter(data.iter().map(|&s| convert(s)));
                let lost = data.len() - pushed;
                if lost > 0 {
                    dropped.fetch_add(lost as u64, Ordering::Relaxed);
                }
            },
            |err| {
                tracing::error!("audio stream error: {err}");
            },
            None,
        )
        .map_err(|e| StreamRelayError::BackendError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Device tests require actual audio hardware and are skipped in CI
    #[test]
    #[ignore = "requires audio hardware"]
    fn test_open_default_input() {
        let opened = DeviceCapture::open(Selector::DefaultInput, Duration::from_secs(1)).unwrap();
        println!("Default device: {}", opened.source.name());
        opened.source.start().unwrap();
        std::thread::sleep(Duration::from_millis(200));
        opened.source.stop().unwrap();
    }

    #[test]
    #[ignore = "requires audio hardware"]
    fn test_open_loopback() {
        let opened = DeviceCapture::open(Selector::Loopback, Duration::from_secs(1)).unwrap();
        assert!(opened.source.name().ends_with("(loopback)"));
        assert!(opened.source.format().sample_rate > 0);
    }

    #[test]
    fn test_unknown_device_name() {
        let result = DeviceCapture::open(
            Selector::Named("no such device 4711".to_string()),
            Duration::from_secs(1),
        );
        assert!(result.is_err());
    }
}
