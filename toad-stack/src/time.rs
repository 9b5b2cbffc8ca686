use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use embedded_time::duration::Milliseconds;

/// A duration, in milliseconds
pub type Millis = embedded_time::duration::Milliseconds<u64>;

/// Work handed to a [`Scheduler`]
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a scheduled [`Task`].
///
/// Cancelling is idempotent and safe to race against the task firing;
/// a task whose handle was cancelled before it fired never runs.
///
/// ```
/// use toad_stack::time::TimerHandle;
///
/// let timer = TimerHandle::new();
/// assert!(timer.cancel());
/// assert!(!timer.cancel());
/// assert!(timer.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct TimerHandle(Arc<AtomicBool>);

impl TimerHandle {
  /// A fresh, uncancelled handle
  pub fn new() -> Self {
    Self::default()
  }

  /// Cancel the timer, yielding `true` if this call cancelled it
  pub fn cancel(&self) -> bool {
    !self.0.swap(true, Ordering::SeqCst)
  }

  #[allow(missing_docs)]
  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }

  /// Are `self` and `other` handles to the same timer?
  pub fn same(&self, other: &TimerHandle) -> bool {
    Arc::ptr_eq(&self.0, &other.0)
  }
}

/// Runs tasks after a delay.
///
/// All timers of the stack (retransmission, blockwise cleanup, observe
/// re-registration) and every deferred call back into the stack go through this.
pub trait Scheduler: Send + Sync + core::fmt::Debug {
  /// Time elapsed since some fixed epoch
  fn now(&self) -> Millis;

  /// Run `task` once `delay` has elapsed, unless `timer` is cancelled first
  fn schedule(&self, timer: TimerHandle, delay: Millis, task: Task);

  /// Run `task` once `delay` has elapsed, yielding a handle that cancels it
  fn after(&self, delay: Millis, task: Task) -> TimerHandle {
    let timer = TimerHandle::new();
    self.schedule(timer.clone(), delay, task);
    timer
  }

  /// Run `task` on a separate turn, as soon as possible
  fn execute(&self, task: Task) {
    self.schedule(TimerHandle::new(), Milliseconds(0), task)
  }
}

/// Cancel the timer in `slot` (if any) and clear it
pub(crate) fn cancel(slot: &mut Option<TimerHandle>) {
  if let Some(t) = slot.take() {
    t.cancel();
  }
}

/// A random number generator seeded from `seed`, the scheduler's clock and the wall clock
pub(crate) fn rng(seed: u16, now: Millis) -> rand_chacha::ChaCha8Rng {
  use rand::SeedableRng;

  let wall = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH)
                                         .map(|d| d.as_nanos() as u64)
                                         .unwrap_or_default();

  rand_chacha::ChaCha8Rng::seed_from_u64((u64::from(seed) << 48) ^ now.0 ^ wall)
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn cancel_slot_is_idempotent() {
    let timer = TimerHandle::new();
    let mut slot = Some(timer.clone());

    cancel(&mut slot);
    cancel(&mut slot);

    assert!(slot.is_none());
    assert!(timer.is_cancelled());
    assert!(!timer.cancel());
  }

  #[test]
  fn same() {
    let a = TimerHandle::new();
    assert!(a.same(&a.clone()));
    assert!(!a.same(&TimerHandle::new()));
  }
}
