use std::sync::Arc;

use crate::chain::{self, AsAny, Snapshot};
use crate::exchange::Exchange;
use crate::msg::EmptyMessage;
use crate::req::Request;
use crate::resp::Response;

/// Sentinels and the composed stack
pub mod stack;

/// Token provisioning
pub mod provision_tokens;

/// Retransmission, message IDs and duplicate handling
pub mod reliability;

/// Blockwise transfer
pub mod block;

/// Observe relations and notifications
pub mod observe;

#[doc(inline)]
pub use block::Blockwise;
#[doc(inline)]
pub use observe::Observe;
#[doc(inline)]
pub use provision_tokens::ProvisionTokens;
#[doc(inline)]
pub use reliability::Reliability;
#[doc(inline)]
pub use stack::Stack;

/// Errors that abort a call travelling through the stack.
///
/// These indicate a defect in how the stack is wired or fed,
/// not a network condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
  /// A request or response arrived without a token.
  ///
  /// Messages must be given a token (possibly empty) before they are
  /// received by the stack.
  MissingToken,
  /// A call tried to move past the head or tail of the chain
  EndOfChain,
  /// Editing the chain failed
  Chain(chain::Error),
}

impl From<chain::Error> for Error {
  fn from(e: chain::Error) -> Self {
    Self::Chain(e)
  }
}

impl core::fmt::Display for Error {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    match self {
      | Self::MissingToken => f.write_str("message reached the stack without a token"),
      | Self::EndOfChain => f.write_str("call moved past the end of the chain"),
      | Self::Chain(e) => write!(f, "{}", e),
    }
  }
}

impl std::error::Error for Error {}

/// One stage of the stack.
///
/// Outbound calls (`send_*`) travel from the top of the stack to the bottom,
/// inbound calls (`receive_*`) from the bottom to the top. Every operation
/// passes its message on unchanged by default, so a layer only overrides
/// the operations it cares about.
///
/// Layers are shared by every exchange; per-exchange state belongs on the
/// [`Exchange`].
#[allow(unused_variables)]
pub trait Layer: AsAny + Send + Sync + core::fmt::Debug {
  #[allow(missing_docs)]
  fn send_request(&self, next: &Next, exchange: &Exchange, request: Request) -> Result<(), Error> {
    next.send_request(exchange, request)
  }

  #[allow(missing_docs)]
  fn send_response(&self,
                   next: &Next,
                   exchange: &Exchange,
                   response: Response)
                   -> Result<(), Error> {
    next.send_response(exchange, response)
  }

  #[allow(missing_docs)]
  fn send_empty_message(&self,
                        next: &Next,
                        exchange: &Exchange,
                        message: EmptyMessage)
                        -> Result<(), Error> {
    next.send_empty_message(exchange, message)
  }

  #[allow(missing_docs)]
  fn receive_request(&self,
                     next: &Next,
                     exchange: &Exchange,
                     request: Request)
                     -> Result<(), Error> {
    next.receive_request(exchange, request)
  }

  #[allow(missing_docs)]
  fn receive_response(&self,
                      next: &Next,
                      exchange: &Exchange,
                      response: Response)
                      -> Result<(), Error> {
    next.receive_response(exchange, response)
  }

  #[allow(missing_docs)]
  fn receive_empty_message(&self,
                           next: &Next,
                           exchange: &Exchange,
                           message: EmptyMessage)
                           -> Result<(), Error> {
    next.receive_empty_message(exchange, message)
  }
}

/// A layer's handle to its neighbours.
///
/// Bound to the position of one layer in a snapshot of the chain;
/// `send_*` continues with the layer below it and `receive_*`
/// with the layer above it.
#[derive(Clone)]
pub struct Next {
  entries: Snapshot<dyn Layer>,
  ix: usize,
}

impl Next {
  pub(crate) fn at(entries: Snapshot<dyn Layer>, ix: usize) -> Self {
    Self { entries, ix }
  }

  /// The layer this handle is bound to
  pub fn this(&self) -> &Arc<dyn Layer> {
    self.entries[self.ix].filter()
  }

  fn below(&self) -> Result<(Next, Arc<dyn Layer>), Error> {
    self.neighbour(self.ix.checked_add(1))
  }

  fn above(&self) -> Result<(Next, Arc<dyn Layer>), Error> {
    self.neighbour(self.ix.checked_sub(1))
  }

  fn neighbour(&self, ix: Option<usize>) -> Result<(Next, Arc<dyn Layer>), Error> {
    let ix = ix.filter(|ix| *ix < self.entries.len())
               .ok_or(Error::EndOfChain)?;
    let layer = self.entries[ix].filter().clone();
    Ok((Self::at(self.entries.clone(), ix), layer))
  }

  /// Pass a request to the layer below
  pub fn send_request(&self, exchange: &Exchange, request: Request) -> Result<(), Error> {
    let (next, layer) = self.below()?;
    layer.send_request(&next, exchange, request)
  }

  /// Pass a response to the layer below
  pub fn send_response(&self, exchange: &Exchange, response: Response) -> Result<(), Error> {
    let (next, layer) = self.below()?;
    layer.send_response(&next, exchange, response)
  }

  /// Pass an empty message to the layer below
  pub fn send_empty_message(&self, exchange: &Exchange, message: EmptyMessage) -> Result<(), Error> {
    let (next, layer) = self.below()?;
    layer.send_empty_message(&next, exchange, message)
  }

  /// Pass a request to the layer above
  pub fn receive_request(&self, exchange: &Exchange, request: Request) -> Result<(), Error> {
    let (next, layer) = self.above()?;
    layer.receive_request(&next, exchange, request)
  }

  /// Pass a response to the layer above
  pub fn receive_response(&self, exchange: &Exchange, response: Response) -> Result<(), Error> {
    let (next, layer) = self.above()?;
    layer.receive_response(&next, exchange, response)
  }

  /// Pass an empty message to the layer above
  pub fn receive_empty_message(&self,
                               exchange: &Exchange,
                               message: EmptyMessage)
                               -> Result<(), Error> {
    let (next, layer) = self.above()?;
    layer.receive_empty_message(&next, exchange, message)
  }
}

impl core::fmt::Debug for Next {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Next")
     .field("layer", &self.entries[self.ix].name())
     .finish()
  }
}
