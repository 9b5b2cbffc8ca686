use std::sync::Arc;

use super::{Blockwise, Error, Layer, Next, Observe, ProvisionTokens, Reliability};
use crate::chain::Chain;
use crate::config;
use crate::exchange::Exchange;
use crate::msg::EmptyMessage;
use crate::req::Request;
use crate::resp::Response;
use crate::time::Scheduler;

/// Name of the [`Observe`] layer in [`Stack::new`]
pub const OBSERVE: &str = "observe";
/// Name of the [`Blockwise`] layer in [`Stack::new`]
pub const BLOCKWISE: &str = "blockwise";
/// Name of the [`ProvisionTokens`] layer in [`Stack::new`]
pub const TOKENS: &str = "tokens";
/// Name of the [`Reliability`] layer in [`Stack::new`]
pub const RELIABILITY: &str = "reliability";

/// The application end of the stack.
///
/// Records the whole request / response on the exchange on the way down,
/// and hands complete messages to the exchange's [`Deliverer`](crate::exchange::Deliverer)
/// on the way up.
#[derive(Debug, Clone, Copy, Default)]
pub struct Top;

impl Layer for Top {
  fn send_request(&self, next: &Next, exchange: &Exchange, req: Request) -> Result<(), Error> {
    exchange.set_request(req.clone());
    next.send_request(exchange, req)
  }

  fn send_response(&self,
                   next: &Next,
                   exchange: &Exchange,
                   resp: Response)
                   -> Result<(), Error> {
    exchange.set_response(resp.clone());
    next.send_response(exchange, resp)
  }

  fn receive_request(&self, _: &Next, exchange: &Exchange, req: Request) -> Result<(), Error> {
    exchange.set_request(req);
    exchange.deliverer().deliver_request(exchange);
    Ok(())
  }

  fn receive_response(&self, _: &Next, exchange: &Exchange, resp: Response) -> Result<(), Error> {
    if !resp.msg().has_observe() {
      exchange.complete();
    }

    exchange.deliverer().deliver_response(exchange, resp);
    Ok(())
  }

  fn receive_empty_message(&self, _: &Next, _: &Exchange, _: EmptyMessage) -> Result<(), Error> {
    Ok(())
  }
}

/// The transport end of the stack; hands everything sent to the
/// exchange's [`Outbox`](crate::exchange::Outbox)
#[derive(Debug, Clone, Copy, Default)]
pub struct Bottom;

impl Layer for Bottom {
  fn send_request(&self, _: &Next, exchange: &Exchange, req: Request) -> Result<(), Error> {
    log::trace!("sending {}", crate::logging::msg_summary(req.msg()));
    exchange.outbox().send_request(exchange, req);
    Ok(())
  }

  fn send_response(&self, _: &Next, exchange: &Exchange, resp: Response) -> Result<(), Error> {
    log::trace!("sending {}", crate::logging::msg_summary(resp.msg()));
    exchange.outbox().send_response(exchange, resp);
    Ok(())
  }

  fn send_empty_message(&self,
                        _: &Next,
                        exchange: &Exchange,
                        msg: EmptyMessage)
                        -> Result<(), Error> {
    log::trace!("sending {}", crate::logging::msg_summary(msg.msg()));
    exchange.outbox().send_empty_message(exchange, msg);
    Ok(())
  }
}

/// A chain of [`Layer`]s between a [`Top`] and a [`Bottom`] sentinel.
///
/// Outbound calls enter at the top, inbound calls at the bottom.
/// Layers can be added, replaced and removed while messages travel
/// through the stack; a call already in flight keeps seeing the
/// layers it started with.
///
/// ```
/// use std::sync::Arc;
///
/// use toad_stack::config::Shared;
/// use toad_stack::layer::stack::{self, Stack};
/// use toad_stack::std::Scheduler;
///
/// let layers = Stack::new(Shared::default(), Arc::new(Scheduler::new())).unwrap();
/// assert_eq!(layers.chain().names(),
///            vec![stack::OBSERVE, stack::BLOCKWISE, stack::TOKENS, stack::RELIABILITY]);
/// ```
#[derive(Debug)]
pub struct Stack {
  chain: Chain<dyn Layer>,
}

impl Stack {
  /// A stack of just the sentinels
  pub fn empty() -> Self {
    Self { chain: Chain::new(Arc::new(Top), Arc::new(Bottom)) }
  }

  /// The CoAP stack: observe, blockwise, tokens and reliability, top to bottom
  pub fn new(config: config::Shared, scheduler: Arc<dyn Scheduler>) -> Result<Self, Error> {
    let self_ = Self::empty();
    let tokens = ProvisionTokens::new(&config, scheduler.now());

    self_.chain
         .add_last(OBSERVE, Arc::new(Observe::new(config.clone(), scheduler.clone())))?;
    self_.chain
         .add_last(BLOCKWISE, Arc::new(Blockwise::new(config.clone(), scheduler.clone())))?;
    self_.chain.add_last(TOKENS, Arc::new(tokens))?;
    self_.chain
         .add_last(RELIABILITY, Arc::new(Reliability::new(config, scheduler)))?;

    Ok(self_)
  }

  /// The layers of the stack, for inspection and editing
  pub fn chain(&self) -> &Chain<dyn Layer> {
    &self.chain
  }

  fn head(&self) -> Next {
    Next::at(self.chain.snapshot(), 0)
  }

  fn tail(&self) -> Next {
    let entries = self.chain.snapshot();
    let ix = entries.len().saturating_sub(1);
    Next::at(entries, ix)
  }

  /// Send a request down the stack
  pub fn send_request(&self, exchange: &Exchange, req: Request) -> Result<(), Error> {
    let head = self.head();
    head.this().send_request(&head, exchange, req)
  }

  /// Send a response down the stack
  pub fn send_response(&self, exchange: &Exchange, resp: Response) -> Result<(), Error> {
    let head = self.head();
    head.this().send_response(&head, exchange, resp)
  }

  /// Send an empty message down the stack
  pub fn send_empty_message(&self, exchange: &Exchange, msg: EmptyMessage) -> Result<(), Error> {
    let head = self.head();
    head.this().send_empty_message(&head, exchange, msg)
  }

  /// Pass a request received from the network up the stack
  pub fn receive_request(&self, exchange: &Exchange, req: Request) -> Result<(), Error> {
    let tail = self.tail();
    tail.this().receive_request(&tail, exchange, req)
  }

  /// Pass a response received from the network up the stack
  pub fn receive_response(&self, exchange: &Exchange, resp: Response) -> Result<(), Error> {
    let tail = self.tail();
    tail.this().receive_response(&tail, exchange, resp)
  }

  /// Pass an empty message received from the network up the stack
  pub fn receive_empty_message(&self, exchange: &Exchange, msg: EmptyMessage) -> Result<(), Error> {
    let tail = self.tail();
    tail.this().receive_empty_message(&tail, exchange, msg)
  }
}

impl Default for Stack {
  fn default() -> Self {
    Self::empty()
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::config::Config;
  use crate::exchange::Origin;
  use crate::resp::code;
  use crate::test::{self, Harness};

  /// Appends its name to a message's payload on the way through
  #[derive(Debug)]
  struct Tag(&'static str);

  impl Layer for Tag {
    fn send_request(&self, next: &Next, exchange: &Exchange, mut req: Request) -> Result<(), Error> {
      req.msg_mut().payload.extend(self.0.bytes());
      next.send_request(exchange, req)
    }

    fn receive_request(&self,
                       next: &Next,
                       exchange: &Exchange,
                       mut req: Request)
                       -> Result<(), Error> {
      req.msg_mut().payload.extend(self.0.bytes());
      next.receive_request(exchange, req)
    }
  }

  #[test]
  fn calls_travel_in_chain_order() {
    let h = Harness::new(Config::default());
    h.stack.chain().add_last("a", Arc::new(Tag("a"))).unwrap();
    h.stack.chain().add_last("b", Arc::new(Tag("b"))).unwrap();

    let ex = h.exchange(Origin::Local);
    h.stack.send_request(&ex, Request::get("x")).unwrap();
    assert_eq!(h.outbox.requests()[0].msg().payload, b"ab".to_vec());

    let ex = h.exchange(Origin::Remote);
    h.stack
     .receive_request(&ex, test::con_request(1, 1))
     .unwrap();
    assert_eq!(h.deliverer.requests()[0].msg().payload, b"ba".to_vec());
  }

  #[test]
  fn top_records_and_completes() {
    let h = Harness::new(Config::default());

    let ex = h.exchange(Origin::Local);
    h.stack.send_request(&ex, Request::get("x")).unwrap();
    assert!(ex.request().is_some());

    let mut resp = Response::new(code::CONTENT);
    resp.msg_mut().set_observe(3);
    h.stack.receive_response(&ex, resp).unwrap();
    assert!(!ex.is_complete());

    h.stack
     .receive_response(&ex, Response::new(code::CONTENT))
     .unwrap();
    assert!(ex.is_complete());
    assert_eq!(h.deliverer.responses().len(), 2);
  }

  #[test]
  fn layers_can_be_swapped_live() {
    let h = Harness::full(Config::default());
    let tokens = h.stack.chain().get_by_type::<ProvisionTokens>();
    assert!(tokens.is_some());

    h.stack
     .chain()
     .replace(TOKENS, "tagged", Arc::new(Tag("t")))
     .unwrap();
    assert!(h.stack.chain().get_by_type::<ProvisionTokens>().is_none());

    let ex = h.exchange(Origin::Local);
    h.stack.send_request(&ex, Request::get("x")).unwrap();
    let sent = h.outbox.requests()[0].clone();
    assert_eq!(sent.msg().payload, b"t".to_vec());
    assert_eq!(sent.msg().token, None);
  }

  #[test]
  fn sentinels_cannot_be_passed() {
    let h = Harness::new(Config::default());
    let ex = h.exchange(Origin::Local);
    let tail = h.stack.tail();
    assert_eq!(tail.send_request(&ex, Request::get("x")), Err(Error::EndOfChain));
  }
}
