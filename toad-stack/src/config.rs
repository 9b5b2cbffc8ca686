use std::sync::Arc;

use embedded_time::duration::Milliseconds;
use toad_stem::Stem;

use crate::time::Millis;

/// Configuration options related to retransmitting outbound CON messages
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Con {
  /// Minimum time to wait for an ACK before retransmitting
  ///
  /// Defaults to 2 seconds.
  /// ```
  /// use embedded_time::duration::Milliseconds;
  /// use toad_stack::config::Con;
  ///
  /// assert_eq!(Con::default().ack_timeout, Milliseconds(2_000u64));
  /// ```
  pub ack_timeout: Millis,
  /// The first retransmission waits for a random duration between
  /// `ack_timeout` and `ack_timeout * ack_random_factor`
  ///
  /// Defaults to 1.5.
  /// ```
  /// use toad_stack::config::Con;
  ///
  /// assert_eq!(Con::default().ack_random_factor, 1.5);
  /// ```
  pub ack_random_factor: f64,
  /// Every subsequent retransmission waits this many times longer than the last
  ///
  /// Defaults to 2.0 (exponential backoff).
  /// ```
  /// use toad_stack::config::Con;
  ///
  /// assert_eq!(Con::default().ack_timeout_scale, 2.0);
  /// ```
  pub ack_timeout_scale: f64,
  /// Number of times we are allowed to resend a CON message
  /// before giving up on it.
  ///
  /// Defaults to 4.
  /// ```
  /// use toad_stack::config::Con;
  ///
  /// assert_eq!(Con::default().max_retransmit, 4);
  /// ```
  pub max_retransmit: u16,
}

/// Configuration options related to outbound messages
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Msg {
  /// Seed mixed into the random starting points of
  /// tokens and message IDs.
  ///
  /// The default value is 0, although it is
  /// best practice to set this to something else.
  /// (random integer, machine identifier)
  ///
  /// ```
  /// use toad_stack::config::Msg;
  ///
  /// assert_eq!(Msg::default().token_seed, 0);
  /// ```
  pub token_seed: u16,
  /// Start the token counter at a random value instead of 0
  ///
  /// ```
  /// use toad_stack::config::Msg;
  ///
  /// assert!(Msg::default().use_random_token_start);
  /// ```
  pub use_random_token_start: bool,
  /// Start the message ID counter at a random value instead of 0
  ///
  /// ```
  /// use toad_stack::config::Msg;
  ///
  /// assert!(Msg::default().use_random_id_start);
  /// ```
  pub use_random_id_start: bool,
  /// Payloads larger than this many bytes are sent blockwise
  ///
  /// ```
  /// use toad_stack::config::Msg;
  ///
  /// assert_eq!(Msg::default().max_message_size, 1024);
  /// ```
  pub max_message_size: usize,
  /// See [`Con`]
  pub con: Con,
}

/// Configuration options related to blockwise transfer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Block {
  /// Preferred block size in bytes, rounded down to a power of two between 16 and 1024
  ///
  /// ```
  /// use toad_stack::config::Block;
  ///
  /// assert_eq!(Block::default().default_size, 512);
  /// ```
  pub default_size: usize,
  /// A blockwise transfer that makes no progress for this long is abandoned
  ///
  /// Defaults to 10 minutes.
  /// ```
  /// use embedded_time::duration::Milliseconds;
  /// use toad_stack::config::Block;
  ///
  /// assert_eq!(Block::default().status_lifetime, Milliseconds(10 * 60 * 1_000u64));
  /// ```
  pub status_lifetime: Millis,
}

/// Configuration options related to observe relations
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observe {
  /// Extra time to wait past a notification's Max-Age
  /// before re-registering interest in the resource
  ///
  /// ```
  /// use embedded_time::duration::Milliseconds;
  /// use toad_stack::config::Observe;
  ///
  /// assert_eq!(Observe::default().reregistration_backoff, Milliseconds(2_000u64));
  /// ```
  pub reregistration_backoff: Millis,
  /// A notification is sent CON at least this often
  ///
  /// Defaults to 24 hours.
  /// ```
  /// use embedded_time::duration::Milliseconds;
  /// use toad_stack::config::Observe;
  ///
  /// assert_eq!(Observe::default().check_interval, Milliseconds(24 * 60 * 60 * 1_000u64));
  /// ```
  pub check_interval: Millis,
  /// Every `check_interval_count`th notification is sent CON
  ///
  /// ```
  /// use toad_stack::config::Observe;
  ///
  /// assert_eq!(Observe::default().check_interval_count, 100);
  /// ```
  pub check_interval_count: u32,
}

impl Default for Con {
  fn default() -> Self {
    Con { ack_timeout: Milliseconds(2_000),
          ack_random_factor: 1.5,
          ack_timeout_scale: 2.0,
          max_retransmit: 4 }
  }
}

impl Default for Msg {
  fn default() -> Self {
    Msg { token_seed: 0,
          use_random_token_start: true,
          use_random_id_start: true,
          max_message_size: 1024,
          con: Con::default() }
  }
}

impl Default for Block {
  fn default() -> Self {
    Block { default_size: 512,
            status_lifetime: Milliseconds(10 * 60 * 1_000) }
  }
}

impl Default for Observe {
  fn default() -> Self {
    Observe { reregistration_backoff: Milliseconds(2_000),
              check_interval: Milliseconds(24 * 60 * 60 * 1_000),
              check_interval_count: 100 }
  }
}

/// Runtime config
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Config {
  /// See [`Msg`]
  pub msg: Msg,
  /// See [`Block`]
  pub block: Block,
  /// See [`Observe`]
  pub observe: Observe,
}

impl Config {
  /// Longest time a CON message can wait for an ACK, from first transmission
  /// until it times out
  ///
  /// ```
  /// use toad_stack::config::Config;
  ///
  /// // 2000 * (1 + 2 + 4 + 8 + 16) * 1.5
  /// assert_eq!(Config::default().max_transmit_wait_millis(), 93_000);
  /// ```
  pub fn max_transmit_wait_millis(&self) -> u64 {
    let con = self.msg.con;
    let scale = (0..=con.max_retransmit).map(|n| con.ack_timeout_scale.powi(i32::from(n)))
                                        .sum::<f64>();

    (con.ack_timeout.0 as f64 * scale * con.ack_random_factor) as u64
  }
}

type Listener = Arc<dyn Fn(&Config, &Config) + Send + Sync>;

struct SharedInner {
  current: Stem<Config>,
  listeners: Stem<Vec<Listener>>,
}

/// Live configuration shared by every layer of a stack.
///
/// Layers read it with [`Shared::get`] on every call, so edits
/// made with [`Shared::set`] or [`Shared::update`] apply to the
/// next message without rebuilding the stack.
///
/// ```
/// use std::sync::atomic::{AtomicU16, Ordering};
/// use std::sync::Arc;
///
/// use toad_stack::config::{Config, Shared};
///
/// let config = Shared::new(Config::default());
/// let seen = Arc::new(AtomicU16::new(0));
///
/// let seen_ = seen.clone();
/// config.on_change(move |_old, new| seen_.store(new.msg.con.max_retransmit, Ordering::SeqCst));
/// config.update(|c| c.msg.con.max_retransmit = 7);
///
/// assert_eq!(config.get().msg.con.max_retransmit, 7);
/// assert_eq!(seen.load(Ordering::SeqCst), 7);
/// ```
#[derive(Clone)]
pub struct Shared(Arc<SharedInner>);

impl Shared {
  /// Share a config
  pub fn new(config: Config) -> Self {
    Self(Arc::new(SharedInner { current: Stem::new(config),
                                listeners: Stem::new(Vec::new()) }))
  }

  /// Copy of the current config
  pub fn get(&self) -> Config {
    self.0.current.map_ref(|c| *c)
  }

  /// Replace the config, notifying listeners
  pub fn set(&self, config: Config) {
    self.update(|c| *c = config)
  }

  /// Edit the config in place, notifying listeners
  pub fn update<F>(&self, f: F)
    where F: FnOnce(&mut Config)
  {
    let mut f = Some(f);
    let (old, new) = self.0.current.map_mut(|c| {
                                      let old = *c;
                                      if let Some(f) = f.take() {
                                        f(c);
                                      }
                                      (old, *c)
                                    });

    if old != new {
      log::debug!("config changed: {:?}", new);
      let listeners = self.0.listeners.map_ref(|ls| ls.clone());
      listeners.iter().for_each(|l| l(&old, &new));
    }
  }

  /// Invoke `f` with the old and new config whenever it changes
  pub fn on_change<F>(&self, f: F)
    where F: Fn(&Config, &Config) + Send + Sync + 'static
  {
    let mut f = Some(Arc::new(f) as Listener);
    self.0.listeners.map_mut(|ls| ls.extend(f.take()));
  }
}

impl Default for Shared {
  fn default() -> Self {
    Self::new(Config::default())
  }
}

impl From<Config> for Shared {
  fn from(c: Config) -> Self {
    Self::new(c)
  }
}

impl core::fmt::Debug for Shared {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_tuple("Shared").field(&self.get()).finish()
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn unchanged_update_does_not_notify() {
    let config = Shared::default();
    let hits = Arc::new(Stem::new(0));
    let hits_ = hits.clone();
    config.on_change(move |_, _| hits_.map_mut(|n| *n += 1));

    config.update(|_| ());
    config.set(Config::default());
    assert_eq!(hits.map_ref(|n| *n), 0);

    config.update(|c| c.block.default_size = 64);
    assert_eq!(hits.map_ref(|n| *n), 1);
  }

  #[test]
  fn clones_share_config() {
    let a = Shared::default();
    let b = a.clone();
    a.update(|c| c.msg.max_message_size = 64);
    assert_eq!(b.get().msg.max_message_size, 64);
  }
}
