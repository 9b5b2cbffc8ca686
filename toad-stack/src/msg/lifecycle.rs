use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use toad_stem::Stem;

use super::Message;

/// Reacts to state transitions of a single message instance.
///
/// A message has at most one observer; installing another replaces it.
/// Callbacks run on whichever thread caused the transition, after any
/// locks held by the stack have been released.
pub trait MessageObserver: Send + Sync + core::fmt::Debug {
  /// The message was acknowledged by the peer
  fn on_acknowledged(&self, _msg: &Message) {}
  /// The message was rejected (RST) by the peer
  fn on_rejected(&self, _msg: &Message) {}
  /// The message is about to be retransmitted
  fn on_retransmitting(&self, _msg: &Message) {}
  /// The message was retransmitted too many times without an acknowledgement
  fn on_timed_out(&self, _msg: &Message) {}
  /// The message was cancelled locally
  fn on_cancelled(&self, _msg: &Message) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flag {
  Acknowledged,
  Rejected,
  Cancelled,
  TimedOut,
}

#[derive(Default)]
struct Inner {
  acknowledged: AtomicBool,
  rejected: AtomicBool,
  cancelled: AtomicBool,
  timed_out: AtomicBool,
  observer: Stem<Option<Arc<dyn MessageObserver>>>,
}

/// The state of a message instance that is shared by all of its clones.
///
/// Once any of the flags are raised, no further retransmission is scheduled
/// for the instance.
#[derive(Clone, Default)]
pub struct Lifecycle(Arc<Inner>);

impl Lifecycle {
  fn flag(&self, f: Flag) -> &AtomicBool {
    match f {
      | Flag::Acknowledged => &self.0.acknowledged,
      | Flag::Rejected => &self.0.rejected,
      | Flag::Cancelled => &self.0.cancelled,
      | Flag::TimedOut => &self.0.timed_out,
    }
  }

  pub(crate) fn is(&self, f: Flag) -> bool {
    self.flag(f).load(Ordering::SeqCst)
  }

  /// Raise a flag, yielding `true` if this call raised it
  pub(crate) fn raise(&self, f: Flag) -> bool {
    !self.flag(f).swap(true, Ordering::SeqCst)
  }

  /// Has the instance been acknowledged, rejected, cancelled or timed out?
  pub fn is_settled(&self) -> bool {
    [Flag::Acknowledged, Flag::Rejected, Flag::Cancelled, Flag::TimedOut].into_iter()
                                                                        .any(|f| self.is(f))
  }

  /// Do `self` and `other` belong to the same message instance?
  pub fn ptr_eq(&self, other: &Lifecycle) -> bool {
    Arc::ptr_eq(&self.0, &other.0)
  }

  pub(crate) fn observer(&self) -> Option<Arc<dyn MessageObserver>> {
    self.0.observer.map_ref(|o| o.clone())
  }

  pub(crate) fn set_observer(&self, obs: Option<Arc<dyn MessageObserver>>) {
    let mut obs = Some(obs);
    self.0.observer.map_mut(|o| *o = obs.take().flatten());
  }
}

impl core::fmt::Debug for Lifecycle {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Lifecycle")
     .field("acknowledged", &self.is(Flag::Acknowledged))
     .field("rejected", &self.is(Flag::Rejected))
     .field("cancelled", &self.is(Flag::Cancelled))
     .field("timed_out", &self.is(Flag::TimedOut))
     .field("observed", &self.observer().is_some())
     .finish()
  }
}
