use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    },
};

use calloop::{
    channel::{self, Channel, ChannelError, Sender},
    EventSource, Poll, PostAction, Readiness, Token, TokenFactory,
};
use tracing::{trace, warn};

use super::{hw::RecoveryReason, state::CrtcIndex};
use crate::utils::{Clock, Monotonic, Time};

/// Events that can be generated by a [`DpuDevice`](super::DpuDevice)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpuEvent {
    /// A commit on the provided crtc reached frame start
    VBlank(CrtcIndex),
    /// The provided crtc was reset after a hardware failure
    Recovery {
        /// Crtc that was recovered
        crtc: CrtcIndex,
        /// What triggered the recovery
        reason: RecoveryReason,
    },
}

/// Timing metadata for dpu events
#[derive(Debug, Clone, Copy)]
pub struct EventMetadata {
    /// The time the event was generated
    pub time: Time<Monotonic>,
    /// The sequence number of the frame on the crtc
    pub sequence: u32,
    /// Data attached to the event by the client that requested it
    pub user_data: Option<u64>,
}

/// Sending half of the event channel, shared with the commit workers
pub(crate) struct EventSink {
    sender: Mutex<Sender<(DpuEvent, EventMetadata)>>,
    clock: Clock<Monotonic>,
    sequences: Vec<AtomicU32>,
}

impl EventSink {
    pub(crate) fn send(&self, event: DpuEvent, user_data: Option<u64>) {
        let crtc = match event {
            DpuEvent::VBlank(crtc) | DpuEvent::Recovery { crtc, .. } => crtc,
        };
        let sequence = match (event, self.sequences.get(crtc.0 as usize)) {
            (DpuEvent::VBlank(_), Some(counter)) => counter.fetch_add(1, Ordering::AcqRel).wrapping_add(1),
            (_, Some(counter)) => counter.load(Ordering::Acquire),
            (_, None) => 0,
        };
        let metadata = EventMetadata {
            time: self.clock.now(),
            sequence,
            user_data,
        };
        trace!(?event, ?metadata, "Emitting dpu event");
        if self.sender.lock().unwrap().send((event, metadata)).is_err() {
            warn!(?event, "Event notifier is gone, dropping event");
        }
    }
}

/// Event source notifying about completed frames and recoveries of a
/// [`DpuDevice`](super::DpuDevice)
///
/// Insert it into a calloop event loop to receive [`DpuEvent`]s.
pub struct DpuDeviceNotifier {
    channel: Channel<(DpuEvent, EventMetadata)>,
}

impl fmt::Debug for DpuDeviceNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DpuDeviceNotifier").finish_non_exhaustive()
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("sequences", &self.sequences)
            .finish_non_exhaustive()
    }
}

pub(crate) fn event_channel(crtc_count: usize) -> (EventSink, DpuDeviceNotifier) {
    let (sender, channel) = channel::channel();
    (
        EventSink {
            sender: Mutex::new(sender),
            clock: Clock::new(),
            sequences: (0..crtc_count).map(|_| AtomicU32::new(0)).collect(),
        },
        DpuDeviceNotifier { channel },
    )
}

impl EventSource for DpuDeviceNotifier {
    type Event = DpuEvent;
    type Metadata = EventMetadata;
    type Ret = ();
    type Error = ChannelError;

    #[profiling::function]
    fn process_events<F>(
        &mut self,
        readiness: Readiness,
        token: Token,
        mut callback: F,
    ) -> Result<PostAction, Self::Error>
    where
        F: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
    {
        self.channel.process_events(readiness, token, |event, _| {
            if let channel::Event::Msg((event, mut metadata)) = event {
                callback(event, &mut metadata);
            }
        })
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> Result<(), calloop::Error> {
        self.channel.register(poll, factory)
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> Result<(), calloop::Error> {
        self.channel.reregister(poll, factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> Result<(), calloop::Error> {
        self.channel.unregister(poll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calloop::EventLoop;

    #[test]
    fn events_reach_the_loop() {
        let mut event_loop: EventLoop<'_, Vec<(DpuEvent, u32, Option<u64>)>> = EventLoop::try_new().unwrap();
        let (sink, notifier) = event_channel(2);
        event_loop
            .handle()
            .insert_source(notifier, |event, meta, received| {
                received.push((event, meta.sequence, meta.user_data));
            })
            .unwrap();

        sink.send(DpuEvent::VBlank(CrtcIndex(1)), Some(3));
        sink.send(DpuEvent::VBlank(CrtcIndex(1)), None);
        sink.send(
            DpuEvent::Recovery {
                crtc: CrtcIndex(0),
                reason: RecoveryReason::VblankTimeout,
            },
            None,
        );

        let mut received = Vec::new();
        event_loop
            .dispatch(Some(std::time::Duration::ZERO), &mut received)
            .unwrap();
        assert_eq!(
            received,
            vec![
                (DpuEvent::VBlank(CrtcIndex(1)), 1, Some(3)),
                (DpuEvent::VBlank(CrtcIndex(1)), 2, None),
                (
                    DpuEvent::Recovery {
                        crtc: CrtcIndex(0),
                        reason: RecoveryReason::VblankTimeout
                    },
                    0,
                    None
                ),
            ]
        );
    }
}
