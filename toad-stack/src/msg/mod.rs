use no_std_net::SocketAddr;
pub use toad_msg::{Code, CodeKind, Id, OptNumber, OptValue, Token, Type};

/// Message options
pub mod opt;

/// State shared by every clone of a message
pub mod lifecycle;

/// Empty ACK and RST messages
pub mod empty;

#[doc(inline)]
pub use empty::EmptyMessage;
#[doc(inline)]
pub use lifecycle::{Lifecycle, MessageObserver};
use lifecycle::Flag;
#[doc(inline)]
pub use opt::{known, Block, Opt, Options};

/// Build a token from a 4-byte big-endian counter value
pub fn token_from_u32(n: u32) -> Token {
  Token(n.to_be_bytes().into_iter().collect())
}

/// An empty (zero-length) token, distinct from a token that has not been assigned.
pub fn empty_token() -> Token {
  Token(Default::default())
}

/// A message travelling through the stack.
///
/// Cloning a message copies its data and shares its [`Lifecycle`],
/// so clones are the same message instance as far as acknowledgement,
/// rejection, cancellation and timeouts go.
#[derive(Clone)]
pub struct Message {
  /// Message type, `None` when the stack should decide
  pub ty: Option<Type>,
  /// Message ID, `None` when not yet assigned
  pub id: Option<Id>,
  /// Token, `None` when not yet assigned. An empty token is `Some`.
  pub token: Option<Token>,
  /// Message code
  pub code: Code,
  /// Options
  pub opts: Options,
  /// Payload bytes, possibly one block of a larger payload
  pub payload: Vec<u8>,
  /// Address of the peer that sent this message
  pub source: Option<SocketAddr>,
  /// Address of the peer this message is sent to
  pub destination: Option<SocketAddr>,
  /// Minimum number of retransmissions before this message times out.
  ///
  /// The larger of this and [`Con.max_retransmit`](crate::config::Con::max_retransmit) wins.
  pub max_retransmit: u16,
  /// Set by deduplication (outside the stack) when this message was seen before
  pub duplicate: bool,
  life: Lifecycle,
}

impl Message {
  /// Create a message with no type, ID or token
  pub fn new(code: Code) -> Self {
    Self { ty: None,
           id: None,
           token: None,
           code,
           opts: Options::default(),
           payload: Vec::new(),
           source: None,
           destination: None,
           max_retransmit: 0,
           duplicate: false,
           life: Lifecycle::default() }
  }

  /// The state shared by this message's clones
  pub fn life(&self) -> &Lifecycle {
    &self.life
  }

  /// Is `other` a clone of this message?
  pub fn same_instance(&self, other: &Message) -> bool {
    self.life.ptr_eq(&other.life)
  }

  /// Payload length in bytes
  pub fn payload_size(&self) -> usize {
    self.payload.len()
  }

  /// Is the message confirmable?
  pub fn is_con(&self) -> bool {
    self.ty == Some(Type::Con)
  }

  #[allow(missing_docs)]
  pub fn is_acknowledged(&self) -> bool {
    self.life.is(Flag::Acknowledged)
  }

  #[allow(missing_docs)]
  pub fn is_rejected(&self) -> bool {
    self.life.is(Flag::Rejected)
  }

  #[allow(missing_docs)]
  pub fn is_cancelled(&self) -> bool {
    self.life.is(Flag::Cancelled)
  }

  #[allow(missing_docs)]
  pub fn is_timed_out(&self) -> bool {
    self.life.is(Flag::TimedOut)
  }

  /// Mark the message acknowledged, notifying its observer the first time
  pub fn set_acknowledged(&self) {
    if self.life.raise(Flag::Acknowledged) {
      if let Some(o) = self.life.observer() {
        o.on_acknowledged(self)
      }
    }
  }

  /// Mark the message rejected, notifying its observer the first time
  pub fn set_rejected(&self) {
    if self.life.raise(Flag::Rejected) {
      if let Some(o) = self.life.observer() {
        o.on_rejected(self)
      }
    }
  }

  /// Cancel the message, notifying its observer the first time
  ///
  /// Cancellation is cooperative: pending retransmissions stop and
  /// blockwise transfers stop requesting blocks.
  pub fn set_cancelled(&self) {
    if self.life.raise(Flag::Cancelled) {
      if let Some(o) = self.life.observer() {
        o.on_cancelled(self)
      }
    }
  }

  /// Mark the message timed out, notifying its observer the first time
  pub fn set_timed_out(&self) {
    if self.life.raise(Flag::TimedOut) {
      if let Some(o) = self.life.observer() {
        o.on_timed_out(self)
      }
    }
  }

  pub(crate) fn fire_retransmitting(&self) {
    if let Some(o) = self.life.observer() {
      o.on_retransmitting(self)
    }
  }

  /// Install the observer of this message instance, replacing any existing one
  pub fn set_observer(&self, obs: std::sync::Arc<dyn MessageObserver>) {
    self.life.set_observer(Some(obs))
  }

  #[allow(missing_docs)]
  pub fn block1(&self) -> Option<Block> {
    self.opts.get_u32(known::BLOCK1).map(Block::from)
  }

  #[allow(missing_docs)]
  pub fn set_block1(&mut self, b: Block) {
    self.opts.set_u32(known::BLOCK1, b.into())
  }

  #[allow(missing_docs)]
  pub fn block2(&self) -> Option<Block> {
    self.opts.get_u32(known::BLOCK2).map(Block::from)
  }

  #[allow(missing_docs)]
  pub fn set_block2(&mut self, b: Block) {
    self.opts.set_u32(known::BLOCK2, b.into())
  }

  /// Observe sequence number or registration flag
  pub fn observe(&self) -> Option<u32> {
    self.opts.get_u32(known::OBSERVE)
  }

  #[allow(missing_docs)]
  pub fn has_observe(&self) -> bool {
    self.opts.has(known::OBSERVE)
  }

  #[allow(missing_docs)]
  pub fn set_observe(&mut self, n: u32) {
    self.opts.set_u32(known::OBSERVE, n)
  }

  #[allow(missing_docs)]
  pub fn remove_observe(&mut self) {
    self.opts.remove(known::OBSERVE);
  }

  #[allow(missing_docs)]
  pub fn content_format(&self) -> Option<u16> {
    self.opts
        .get_u32(known::CONTENT_FORMAT)
        .map(|n| n as u16)
  }

  #[allow(missing_docs)]
  pub fn set_content_format(&mut self, cf: u16) {
    self.opts.set_u32(known::CONTENT_FORMAT, cf.into())
  }

  /// Max-Age in seconds, defaulting to 60 when absent
  pub fn max_age(&self) -> u32 {
    self.opts
        .get_u32(known::MAX_AGE)
        .unwrap_or(opt::DEFAULT_MAX_AGE)
  }
}

impl core::fmt::Debug for Message {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Message")
     .field("ty", &self.ty)
     .field("id", &self.id)
     .field("token", &self.token)
     .field("code", &self.code)
     .field("opts", &self.opts)
     .field("payload", &self.payload.len())
     .field("source", &self.source)
     .field("destination", &self.destination)
     .field("duplicate", &self.duplicate)
     .field("life", &self.life)
     .finish()
  }
}
