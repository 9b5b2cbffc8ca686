use embedded_time::duration::Milliseconds;
use rand::Rng;

use crate::config;
use crate::msg::Message;
use crate::req::Request;
use crate::resp::Response;
use crate::time::{self, Millis, TimerHandle};

/// Result of [`Retransmission::what_should_i_do`].
///
/// This tells you if a retransmission should be attempted or not.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum YouShould {
  /// Attempts have been exhausted and the message
  /// should be considered timed out.
  Cry,
  /// A retransmission should be performed
  Retry,
  /// The message was acknowledged, rejected or cancelled
  /// in the meantime; do nothing.
  Stop,
}

/// The CON message a [`Retransmission`] resends
#[derive(Debug, Clone)]
pub enum Outbound {
  #[allow(missing_docs)]
  Request(Request),
  #[allow(missing_docs)]
  Response(Response),
}

impl Outbound {
  /// The message being retransmitted
  pub fn msg(&self) -> &Message {
    match self {
      | Self::Request(r) => r.msg(),
      | Self::Response(r) => r.msg(),
    }
  }
}

/// Initial ACK timeout for a CON message:
/// `ack_timeout + ack_timeout * (ack_random_factor - 1) * jitter`
/// where `jitter` is in `[0, 1)`.
///
/// ```
/// use embedded_time::duration::Milliseconds;
/// use toad_stack::config::Con;
/// use toad_stack::retry::initial_timeout;
///
/// let con = Con::default();
/// assert_eq!(initial_timeout(&con, 0.0), Milliseconds(2_000u64));
/// assert_eq!(initial_timeout(&con, 0.5), Milliseconds(2_500u64));
/// ```
pub fn initial_timeout(con: &config::Con, jitter: f64) -> Millis {
  let ack = con.ack_timeout.0 as f64;
  Milliseconds((ack + ack * (con.ack_random_factor - 1.0) * jitter) as u64)
}

/// Draw an [`initial_timeout`] using `rng` for the jitter
pub fn random_initial_timeout(con: &config::Con, rng: &mut impl Rng) -> Millis {
  initial_timeout(con, rng.gen_range(0.0..1.0))
}

/// Retransmission state of one in-flight CON message
#[derive(Debug)]
pub struct Retransmission {
  outbound: Outbound,
  failed: u16,
  timeout: Millis,
  timer: Option<TimerHandle>,
}

impl Retransmission {
  /// Start tracking `outbound`
  pub fn new(outbound: Outbound) -> Self {
    Self { outbound,
           failed: 0,
           timeout: Milliseconds(0),
           timer: None }
  }

  /// The message to resend
  pub fn outbound(&self) -> &Outbound {
    &self.outbound
  }

  /// Swap the message being tracked, keeping the attempt count.
  pub fn replace(&mut self, outbound: Outbound) {
    self.outbound = outbound;
  }

  /// How many transmissions went unacknowledged so far
  pub fn failed(&self) -> u16 {
    self.failed
  }

  /// The timeout of the most recent transmission
  pub fn timeout(&self) -> Millis {
    self.timeout
  }

  /// Prepare for a (re)transmission guarded by `timer`.
  ///
  /// The first transmission waits `initial`, every retransmission
  /// waits `scale` times longer than the one before.
  /// Yields the delay to arm `timer` with.
  pub fn arm(&mut self, timer: TimerHandle, initial: Millis, scale: f64) -> Millis {
    time::cancel(&mut self.timer);
    self.timeout = if self.failed == 0 {
      initial
    } else {
      Milliseconds((self.timeout.0 as f64 * scale) as u64)
    };
    self.timer = Some(timer);
    self.timeout
  }

  /// Is `timer` the timer guarding the current transmission?
  pub fn is_armed_with(&self, timer: &TimerHandle) -> bool {
    self.timer
        .as_ref()
        .map(|t| t.same(timer) && !t.is_cancelled())
        .unwrap_or(false)
  }

  /// Invoke when the ACK timer fired to find out what to do next
  pub fn what_should_i_do(&mut self, max_retransmit: u16) -> YouShould {
    self.failed += 1;

    if self.outbound.msg().life().is_settled() {
      YouShould::Stop
    } else if self.failed <= max_retransmit {
      YouShould::Retry
    } else {
      YouShould::Cry
    }
  }

  /// Stop retransmitting
  pub fn cancel(&mut self) {
    time::cancel(&mut self.timer);
  }
}

impl Drop for Retransmission {
  fn drop(&mut self) {
    self.cancel();
  }
}

#[cfg(test)]
mod test {
  use rand::SeedableRng;

  use super::*;

  fn ctx() -> Retransmission {
    Retransmission::new(Outbound::Request(Request::get("a")))
  }

  #[test]
  fn initial_timeout_is_jittered_within_bounds() {
    let con = config::Con::default();
    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0);

    (0..100).for_each(|_| {
              let Milliseconds(t) = random_initial_timeout(&con, &mut rng);
              assert!((2_000..3_000).contains(&t), "{}", t);
            });
  }

  #[test]
  fn arm_backs_off_exponentially() {
    let mut ctx = ctx();
    assert_eq!(ctx.arm(TimerHandle::new(), Milliseconds(2_000), 2.0),
               Milliseconds(2_000u64));
    assert_eq!(ctx.what_should_i_do(3), YouShould::Retry);
    assert_eq!(ctx.arm(TimerHandle::new(), Milliseconds(9_999), 2.0),
               Milliseconds(4_000u64));
    assert_eq!(ctx.what_should_i_do(3), YouShould::Retry);
    assert_eq!(ctx.arm(TimerHandle::new(), Milliseconds(9_999), 2.0),
               Milliseconds(8_000u64));
  }

  #[test]
  fn cries_after_max_retransmit() {
    let mut ctx = ctx();
    assert_eq!(ctx.what_should_i_do(2), YouShould::Retry);
    assert_eq!(ctx.what_should_i_do(2), YouShould::Retry);
    assert_eq!(ctx.what_should_i_do(2), YouShould::Cry);
  }

  #[test]
  fn stops_when_settled() {
    let mut ctx = ctx();
    ctx.outbound().msg().set_acknowledged();
    assert_eq!(ctx.what_should_i_do(4), YouShould::Stop);
  }

  #[test]
  fn rearming_cancels_the_previous_timer() {
    let mut ctx = ctx();
    let first = TimerHandle::new();
    ctx.arm(first.clone(), Milliseconds(1), 2.0);
    assert!(ctx.is_armed_with(&first));

    let second = TimerHandle::new();
    ctx.arm(second.clone(), Milliseconds(1), 2.0);
    assert!(first.is_cancelled());
    assert!(!ctx.is_armed_with(&first));
    assert!(ctx.is_armed_with(&second));

    drop(ctx);
    assert!(second.is_cancelled());
  }
}
