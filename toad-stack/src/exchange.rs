use std::sync::{Arc, Weak};

use toad_stem::Stem;

use crate::layer::block::BlockwiseStatus;
use crate::msg::{Block, EmptyMessage};
use crate::relation::ObserveRelation;
use crate::req::Request;
use crate::resp::Response;
use crate::retry::Retransmission;
use crate::time::{self, Millis, TimerHandle};

/// Who initiated an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
  /// We sent the request
  Local,
  /// A peer sent the request
  Remote,
}

/// Hands messages leaving the bottom of the stack to the transport
pub trait Outbox: Send + Sync + core::fmt::Debug {
  #[allow(missing_docs)]
  fn send_request(&self, exchange: &Exchange, request: Request);
  #[allow(missing_docs)]
  fn send_response(&self, exchange: &Exchange, response: Response);
  #[allow(missing_docs)]
  fn send_empty_message(&self, exchange: &Exchange, message: EmptyMessage);
}

/// Hands messages leaving the top of the stack to the application
pub trait Deliverer: Send + Sync + core::fmt::Debug {
  /// A complete request arrived; it is [`Exchange::request`]
  fn deliver_request(&self, exchange: &Exchange);
  /// A complete response (or notification) arrived
  fn deliver_response(&self, exchange: &Exchange, response: Response);
}

#[derive(Debug, Default)]
pub(crate) struct State {
  pub(crate) request: Option<Request>,
  pub(crate) current_request: Option<Request>,
  pub(crate) response: Option<Response>,
  pub(crate) current_response: Option<Response>,
  pub(crate) request_block_status: Option<BlockwiseStatus>,
  pub(crate) response_block_status: Option<BlockwiseStatus>,
  pub(crate) block1_to_ack: Option<Block>,
  pub(crate) relation: Option<ObserveRelation>,
  pub(crate) complete: bool,
  pub(crate) timed_out: bool,
  pub(crate) retransmission: Option<Retransmission>,
  pub(crate) block_cleanup: Option<TimerHandle>,
  pub(crate) reregistration: Option<TimerHandle>,
}

struct Inner {
  origin: Origin,
  timestamp: Millis,
  outbox: Arc<dyn Outbox>,
  deliverer: Arc<dyn Deliverer>,
  state: Stem<State>,
}

/// The context of one logical request / response interaction,
/// shared by every layer of the stack and by the timers they schedule.
///
/// Cloning an `Exchange` yields another handle to the same exchange.
#[derive(Clone)]
pub struct Exchange(Arc<Inner>);

/// A handle to an [`Exchange`] that does not keep it alive
#[derive(Clone)]
pub struct WeakExchange(Weak<Inner>);

impl WeakExchange {
  /// The exchange, if it has not been dropped
  pub fn upgrade(&self) -> Option<Exchange> {
    self.0.upgrade().map(Exchange)
  }
}

impl core::fmt::Debug for WeakExchange {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_tuple("WeakExchange")
     .field(&self.upgrade())
     .finish()
  }
}

macro_rules! slot {
  ($get:ident, $set:ident, $field:ident, $t:ty, $doc:literal) => {
    #[doc = $doc]
    pub fn $get(&self) -> Option<$t> {
      self.map_ref(|s| s.$field.clone())
    }

    #[doc = $doc]
    pub fn $set(&self, v: $t) {
      let mut v = Some(v);
      self.map_mut(|s| s.$field = v.take());
    }
  };
}

impl Exchange {
  /// Create an exchange
  pub fn new(origin: Origin,
             timestamp: Millis,
             outbox: Arc<dyn Outbox>,
             deliverer: Arc<dyn Deliverer>)
             -> Self {
    Self(Arc::new(Inner { origin,
                          timestamp,
                          outbox,
                          deliverer,
                          state: Stem::new(State::default()) }))
  }

  #[allow(missing_docs)]
  pub fn origin(&self) -> Origin {
    self.0.origin
  }

  /// When the exchange was created, according to the stack's scheduler
  pub fn timestamp(&self) -> Millis {
    self.0.timestamp
  }

  #[allow(missing_docs)]
  pub fn outbox(&self) -> &Arc<dyn Outbox> {
    &self.0.outbox
  }

  #[allow(missing_docs)]
  pub fn deliverer(&self) -> &Arc<dyn Deliverer> {
    &self.0.deliverer
  }

  /// A handle that does not keep the exchange alive
  pub fn downgrade(&self) -> WeakExchange {
    WeakExchange(Arc::downgrade(&self.0))
  }

  /// Are `self` and `other` handles to the same exchange?
  pub fn same(&self, other: &Exchange) -> bool {
    Arc::ptr_eq(&self.0, &other.0)
  }

  slot!(request,
        set_request,
        request,
        Request,
        "The whole (possibly reassembled) request");
  slot!(current_request,
        set_current_request,
        current_request,
        Request,
        "The request (or request block) most recently sent or received");
  slot!(response,
        set_response,
        response,
        Response,
        "The whole (possibly reassembled) response");
  slot!(current_response,
        set_current_response,
        current_response,
        Response,
        "The response (or response block) most recently sent or received");
  slot!(relation,
        set_relation,
        relation,
        ObserveRelation,
        "The observe relation, if this exchange is a subscription");

  /// Blockwise state of the request payload
  pub fn request_block_status(&self) -> Option<BlockwiseStatus> {
    self.map_ref(|s| s.request_block_status.clone())
  }

  /// Blockwise state of the response payload
  pub fn response_block_status(&self) -> Option<BlockwiseStatus> {
    self.map_ref(|s| s.response_block_status.clone())
  }

  /// Is a CON message of this exchange waiting for an ACK?
  pub fn is_retransmitting(&self) -> bool {
    self.map_ref(|s| s.retransmission.is_some())
  }

  #[allow(missing_docs)]
  pub fn is_complete(&self) -> bool {
    self.map_ref(|s| s.complete)
  }

  /// Mark the exchange complete and cancel all of its timers.
  ///
  /// Yields `true` if this call completed it.
  pub fn complete(&self) -> bool {
    let completed = self.map_mut(|s| {
                          if s.complete {
                            return false;
                          }

                          s.complete = true;
                          if let Some(mut r) = s.retransmission.take() {
                            r.cancel();
                          }
                          time::cancel(&mut s.block_cleanup);
                          time::cancel(&mut s.reregistration);
                          true
                        });

    if completed {
      log::trace!("exchange complete ({:?})", self.origin());
    }

    completed
  }

  /// Did a CON message of this exchange go unacknowledged?
  pub fn is_timed_out(&self) -> bool {
    self.map_ref(|s| s.timed_out)
  }

  #[allow(missing_docs)]
  pub fn set_timed_out(&self) {
    self.map_mut(|s| s.timed_out = true);
  }

  /// Propagate the type, ID and token the stack assigned to `req` to
  /// every stored copy of the same request instance.
  pub(crate) fn sync_request(&self, req: &Request) {
    let update = |slot: &mut Option<Request>| {
      if let Some(r) = slot.as_mut().filter(|r| r.msg().same_instance(req.msg())) {
        let m = r.msg_mut();
        m.ty = req.msg().ty;
        m.id = req.msg().id;
        m.token = req.msg().token;
      }
    };

    self.map_mut(|s| {
          update(&mut s.request);
          update(&mut s.current_request);
        });
  }

  /// Propagate the type, ID and token the stack assigned to `resp` to
  /// every stored copy of the same response instance.
  pub(crate) fn sync_response(&self, resp: &Response) {
    let update = |slot: &mut Option<Response>| {
      if let Some(r) = slot.as_mut().filter(|r| r.msg().same_instance(resp.msg())) {
        let m = r.msg_mut();
        m.ty = resp.msg().ty;
        m.id = resp.msg().id;
        m.token = resp.msg().token;
      }
    };

    self.map_mut(|s| {
          update(&mut s.response);
          update(&mut s.current_response);
          if let Some(rel) = s.relation.as_ref() {
            rel.map_mut(|r| {
                 update(&mut r.current);
                 update(&mut r.next);
               });
          }
        });
  }

  pub(crate) fn map_ref<F, R>(&self, f: F) -> R
    where F: for<'a> FnMut(&'a State) -> R
  {
    self.0.state.map_ref(f)
  }

  pub(crate) fn map_mut<F, R>(&self, f: F) -> R
    where F: for<'a> FnMut(&'a mut State) -> R
  {
    self.0.state.map_mut(f)
  }
}

impl core::fmt::Debug for Exchange {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    let (complete, timed_out, observing) =
      self.map_ref(|s| (s.complete, s.timed_out, s.relation.is_some()));

    f.debug_struct("Exchange")
     .field("origin", &self.origin())
     .field("timestamp", &self.timestamp())
     .field("complete", &complete)
     .field("timed_out", &timed_out)
     .field("observing", &observing)
     .finish()
  }
}

#[cfg(test)]
mod test {
  use embedded_time::duration::Milliseconds;

  use super::*;
  use crate::test;

  #[test]
  fn complete_cancels_timers_once() {
    let ex = test::exchange(Origin::Local);
    let cleanup = TimerHandle::new();
    let rereg = TimerHandle::new();

    let (c, r) = (cleanup.clone(), rereg.clone());
    let mut timers = Some((c, r));
    ex.map_mut(|s| {
        if let Some((c, r)) = timers.take() {
          s.block_cleanup = Some(c);
          s.reregistration = Some(r);
        }
      });

    assert!(ex.complete());
    assert!(!ex.complete());
    assert!(ex.is_complete());
    assert!(cleanup.is_cancelled());
    assert!(rereg.is_cancelled());
  }

  #[test]
  fn weak_handle_does_not_keep_exchange_alive() {
    let ex = test::exchange(Origin::Remote);
    let weak = ex.downgrade();
    assert!(weak.upgrade().map(|e| e.same(&ex)).unwrap_or(false));

    drop(ex);
    assert!(weak.upgrade().is_none());
  }

  #[test]
  fn sync_request_only_touches_same_instance() {
    let ex = test::exchange(Origin::Local);
    let req = Request::get("a");
    let other = Request::get("b");
    ex.set_request(req.clone());
    ex.set_current_request(other.clone());

    let mut sent = req.clone();
    sent.msg_mut().id = Some(toad_msg::Id(9));
    ex.sync_request(&sent);

    assert_eq!(ex.request().and_then(|r| r.msg().id), Some(toad_msg::Id(9)));
    assert_eq!(ex.current_request().and_then(|r| r.msg().id), None);
    assert_eq!(ex.timestamp(), Milliseconds(0u64));
  }
}
