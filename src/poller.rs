use crate::session::Session;
use crate::types::{ErrorCode, MarkerSample};
use crate::{OwlError, Result};
use std::time::{Duration, Instant};

/// What to do between two polls that returned no new frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPolicy {
    /// Poll again immediately.
    Spin,
    /// Yield the thread, then poll again.
    Yield,
    /// Sleep for the given interval, then poll again.
    Sleep(Duration),
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy::Yield
    }
}

impl PollPolicy {
    fn pause(self) {
        match self {
            PollPolicy::Spin => std::hint::spin_loop(),
            PollPolicy::Yield => std::thread::yield_now(),
            PollPolicy::Sleep(interval) => std::thread::sleep(interval),
        }
    }
}

/// One fresh frame of marker samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Server frame number of the samples.
    pub number: i32,
    pub markers: Vec<MarkerSample>,
    /// Empty polls that preceded this frame.
    pub stale_polls: u32,
}

/// Polls a session for marker frames, skipping stale (empty) replies.
///
/// Any error ends the poll: there is no retry past an error, only past an
/// empty frame. Connection loss therefore shows up as
/// [`OwlError::ConnectionClosed`] instead of an endless run of empty polls.
#[derive(Debug, Clone)]
pub struct FramePoller {
    capacity: usize,
    policy: PollPolicy,
    max_wait: Option<Duration>,
}

impl FramePoller {
    /// Poller requesting up to `capacity` markers per frame, using the
    /// session's configured poll policy.
    pub fn new(session: &Session, capacity: usize) -> Self {
        Self {
            capacity,
            policy: session.config().poll_policy,
            max_wait: None,
        }
    }

    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Give up with [`OwlError::Timeout`] after waiting this long for a
    /// fresh frame.
    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    /// Block until a fresh frame arrives or an error ends the poll.
    pub fn next_frame(&self, session: &mut Session) -> Result<Frame> {
        let started = Instant::now();
        let mut stale_polls = 0u32;

        loop {
            let markers = session.get_markers(self.capacity)?;
            match session.get_error() {
                ErrorCode::NoError => {}
                code => return Err(OwlError::Protocol(code)),
            }

            if let Some(first) = markers.first() {
                return Ok(Frame {
                    number: first.frame,
                    markers,
                    stale_polls,
                });
            }

            stale_polls = stale_polls.saturating_add(1);
            log::trace!("stale frame (poll {})", stale_polls);

            if let Some(max_wait) = self.max_wait {
                if started.elapsed() >= max_wait {
                    return Err(OwlError::Timeout);
                }
            }
            self.policy.pause();
        }
    }

    /// Iterator over fresh frames. Ends after yielding the first error.
    pub fn frames<'a>(&'a self, session: &'a mut Session) -> Frames<'a> {
        Frames {
            poller: self,
            session,
            done: false,
        }
    }
}

/// Iterator returned by [`FramePoller::frames`].
pub struct Frames<'a> {
    poller: &'a FramePoller,
    session: &'a mut Session,
    done: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.poller.next_frame(self.session);
        if item.is_err() {
            self.done = true;
        }
        Some(item)
    }
}

impl std::iter::FusedIterator for Frames<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_yields() {
        assert_eq!(PollPolicy::default(), PollPolicy::Yield);
    }

    #[test]
    fn test_pause_sleeps() {
        let started = Instant::now();
        PollPolicy::Sleep(Duration::from_millis(5)).pause();
        assert!(started.elapsed() >= Duration::from_millis(5));
        PollPolicy::Spin.pause();
        PollPolicy::Yield.pause();
    }
}
