//! Drives outbound audio: one provider poll per frame interval, paced against
//! a fixed schedule so late ticks do not accumulate into drift.

use std::{sync::Arc, time::Duration};

use tokio::{sync::Mutex, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::{
    gateway::{
        constants::RTP_TIMESTAMP_STEP,
        encryption::XSalsa20Poly1305Codec,
        packet::DecryptedPacket,
        session::SessionDescription,
        udp_link::VoiceUdpConnection,
    },
    voice::{
        audio::AudioProvider,
        interceptor::{FrameInterceptorContext, FrameInterceptorFactory},
    },
};

#[derive(Clone)]
pub struct AudioFramePollerConfiguration {
    pub provider: Arc<dyn AudioProvider>,
    pub interceptor_factory: FrameInterceptorFactory,
    /// `ssrc` is overwritten with the one from `description`.
    pub interceptor_context: FrameInterceptorContext,
    pub udp: Arc<VoiceUdpConnection>,
    pub description: Arc<SessionDescription>,
    pub frame_interval: Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct RtpCounters {
    ssrc: Option<u32>,
    sequence: u16,
    timestamp: u32,
}

struct PollerRun {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
pub struct AudioFramePoller {
    run: Mutex<Option<PollerRun>>,
    counters: Arc<parking_lot::Mutex<RtpCounters>>,
}

impl AudioFramePoller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts polling, replacing any run in progress.
    ///
    /// RTP counters carry over when the SSRC is unchanged.
    pub async fn start(&self, config: AudioFramePollerConfiguration) {
        let mut run = self.run.lock().await;
        if let Some(previous) = run.take() {
            previous.cancel.cancel();
            let _ = previous.task.await;
        }

        {
            let mut counters = self.counters.lock();
            if counters.ssrc != Some(config.description.ssrc) {
                *counters = RtpCounters {
                    ssrc: Some(config.description.ssrc),
                    ..Default::default()
                };
            }
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(poll_loop(config, self.counters.clone(), cancel.clone()));
        *run = Some(PollerRun { cancel, task });
    }

    /// Returns once the polling task has exited; nothing is sent after that.
    pub async fn stop(&self) {
        let previous = self.run.lock().await.take();
        if let Some(previous) = previous {
            previous.cancel.cancel();
            let _ = previous.task.await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.run
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Next (sequence, timestamp) the poller would stamp on a packet.
    pub fn counters(&self) -> (u16, u32) {
        let c = self.counters.lock();
        (c.sequence, c.timestamp)
    }
}

impl Drop for AudioFramePoller {
    fn drop(&mut self) {
        if let Some(run) = self.run.get_mut().take() {
            run.cancel.cancel();
        }
    }
}

/// One provider poll per tick. The timestamp advances every tick, but the
/// sequence only advances for packets that were sent, so receivers never see
/// a gap in sequence numbers across silent ticks.
async fn poll_loop(
    config: AudioFramePollerConfiguration,
    counters: Arc<parking_lot::Mutex<RtpCounters>>,
    cancel: CancellationToken,
) {
    let ssrc = config.description.ssrc;
    let codec = match XSalsa20Poly1305Codec::new(&config.description.secret_key) {
        Ok(codec) => codec,
        Err(e) => {
            error!("Audio poller for SSRC {} cannot start: {}", ssrc, e);
            return;
        }
    };

    let mut context = config.interceptor_context.clone();
    context.ssrc = ssrc;
    let mut interceptor = (config.interceptor_factory)(context);

    debug!(
        "Audio poller started (SSRC {}, every {:?})",
        ssrc, config.frame_interval
    );

    let started = Instant::now();
    let mut tick: u32 = 0;

    loop {
        let polled = config.provider.provide();
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = interceptor.intercept(polled) => frame,
        };

        if let Some(frame) = frame {
            let (sequence, timestamp) = {
                let c = counters.lock();
                (c.sequence, c.timestamp)
            };

            match DecryptedPacket::new(sequence, timestamp, ssrc, frame.0).encrypt(&codec) {
                Ok(packet) => match config.udp.send(&packet.to_bytes()).await {
                    Ok(()) => {
                        trace!("Sent audio packet seq={} ts={}", sequence, timestamp);
                        let mut c = counters.lock();
                        c.sequence = c.sequence.wrapping_add(1);
                    }
                    Err(e) => warn!("Dropping audio packet seq={}: {}", sequence, e),
                },
                Err(e) => warn!("Failed to encrypt audio packet seq={}: {}", sequence, e),
            }
        }

        {
            let mut c = counters.lock();
            c.timestamp = c.timestamp.wrapping_add(RTP_TIMESTAMP_STEP);
        }

        tick = tick.wrapping_add(1);
        let deadline = started + config.frame_interval * tick;
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => {}
        }
    }

    debug!("Audio poller stopped (SSRC {})", ssrc);
}
