use core::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use toad_stem::Stem;

use super::{Error, Layer, Next};
use crate::config;
use crate::exchange::{Exchange, Origin, WeakExchange};
use crate::logging::msg_summary;
use crate::msg::{EmptyMessage, Id, Message, Type};
use crate::req::Request;
use crate::resp::Response;
use crate::retry::{self, Outbound, Retransmission, YouShould};
use crate::time::{Scheduler, TimerHandle};

/// Layer responsible for reliable transmission of CON messages.
///
/// - Outbound requests without a type become CON.
/// - Outbound responses without a type piggyback on the ACK of the
///   request they answer when it is still unacknowledged, and are sent
///   as separate CON (or NON, answering a NON request) responses otherwise.
/// - Outbound messages without an ID are given one.
/// - Every CON message is retransmitted with exponential backoff until
///   it is acknowledged, rejected or cancelled, or the configured number
///   of retransmissions runs out, which times out the message and exchange.
/// - Inbound duplicates are answered from the exchange without bothering
///   the layers above.
#[derive(Debug)]
pub struct Reliability {
  config: config::Shared,
  scheduler: Arc<dyn Scheduler>,
  ids: AtomicU16,
  rng: Stem<ChaCha8Rng>,
}

impl Reliability {
  /// Create the layer
  pub fn new(config: config::Shared, scheduler: Arc<dyn Scheduler>) -> Self {
    let cfg = config.get().msg;
    let mut rng = crate::time::rng(cfg.token_seed, scheduler.now());
    let start = if cfg.use_random_id_start {
      rng.gen()
    } else {
      0
    };

    Self { config,
           scheduler,
           ids: AtomicU16::new(start),
           rng: Stem::new(rng) }
  }

  /// The next message ID
  pub fn next_id(&self) -> Id {
    Id(self.ids.fetch_add(1, Ordering::Relaxed))
  }

  fn prepare_retransmission(&self, next: &Next, exchange: &Exchange, outbound: Outbound) {
    let con = self.config.get().msg.con;
    let initial = self.rng
                      .map_mut(|rng| retry::random_initial_timeout(&con, rng));
    let timer = TimerHandle::new();

    let mut outbound = Some(outbound);
    let delay = exchange.map_mut(|s| {
                          let outbound = outbound.take()?;
                          let carry_on = s.retransmission
                                          .as_ref()
                                          .map(|ctx| continues(ctx.outbound().msg(), outbound.msg()))
                                          .unwrap_or(false);

                          if carry_on {
                            if let Some(ctx) = s.retransmission.as_mut() {
                              ctx.replace(outbound);
                            }
                          } else {
                            s.retransmission = Some(Retransmission::new(outbound));
                          }

                          s.retransmission
                           .as_mut()
                           .map(|ctx| ctx.arm(timer.clone(), initial, con.ack_timeout_scale))
                        });

    if let Some(delay) = delay {
      log::trace!("retransmitting in {:?} unless acknowledged", delay);
      let retransmit = Retransmit { next: next.clone(),
                                    exchange: exchange.downgrade(),
                                    config: self.config.clone(),
                                    timer: timer.clone() };
      self.scheduler
          .schedule(timer, delay, Box::new(move || retransmit.fire()));
    }
  }
}

/// Does `new` carry on the retransmission of `old`?
///
/// Either it is the same message going out again, or a fresher
/// notification that took over the ID of one still in flight.
fn continues(old: &Message, new: &Message) -> bool {
  old.same_instance(new) || (old.id.is_some() && old.id == new.id)
}

/// The state a retransmission timer needs when it fires
#[derive(Debug)]
struct Retransmit {
  next: Next,
  exchange: WeakExchange,
  config: config::Shared,
  timer: TimerHandle,
}

impl Retransmit {
  fn fire(self) {
    let exchange = match self.exchange.upgrade() {
      | Some(ex) => ex,
      | None => return,
    };

    let max = self.config.get().msg.con.max_retransmit;
    let decision = exchange.map_mut(|s| match s.retransmission.as_mut() {
                             | Some(ctx) if ctx.is_armed_with(&self.timer) => {
                               let max = ctx.outbound().msg().max_retransmit.max(max);
                               let should = ctx.what_should_i_do(max);
                               Some((should, ctx.outbound().clone(), ctx.failed()))
                             },
                             | _ => None,
                           });

    match decision {
      | None => (),
      | Some((YouShould::Stop, outbound, _)) => {
        log::trace!("{} settled, not retransmitting", msg_summary(outbound.msg()));
        self.forget(&exchange);
      },
      | Some((YouShould::Retry, outbound, attempt)) => {
        log::debug!("retransmitting {} (attempt {})",
                    msg_summary(outbound.msg()),
                    attempt);

        outbound.msg().fire_retransmitting();
        if outbound.msg().is_cancelled() {
          log::trace!("{} was cancelled while retransmitting",
                      msg_summary(outbound.msg()));
          return;
        }

        let layer = self.next.this().clone();
        let sent = match outbound {
          | Outbound::Request(req) => layer.send_request(&self.next, &exchange, req),
          | Outbound::Response(resp) => layer.send_response(&self.next, &exchange, resp),
        };

        if let Err(e) = sent {
          log::error!("retransmission failed: {}", e);
        }
      },
      | Some((YouShould::Cry, outbound, attempts)) => {
        log::debug!("{} timed out after {} transmissions",
                    msg_summary(outbound.msg()),
                    attempts);
        self.forget(&exchange);
        exchange.set_timed_out();
        outbound.msg().set_timed_out();
      },
    }
  }

  fn forget(&self, exchange: &Exchange) {
    let timer = &self.timer;
    let ctx = exchange.map_mut(|s| {
                        let armed = s.retransmission
                                     .as_ref()
                                     .map(|ctx| ctx.is_armed_with(timer))
                                     .unwrap_or(false);
                        if armed {
                          s.retransmission.take()
                        } else {
                          None
                        }
                      });
    drop(ctx);
  }
}

impl Layer for Reliability {
  fn send_request(&self, next: &Next, exchange: &Exchange, mut req: Request) -> Result<(), Error> {
    if req.msg().ty.is_none() {
      req.msg_mut().ty = Some(Type::Con);
    }
    if req.msg().id.is_none() {
      req.msg_mut().id = Some(self.next_id());
    }

    exchange.sync_request(&req);

    if req.msg().is_con() {
      self.prepare_retransmission(next, exchange, Outbound::Request(req.clone()));
    }

    next.send_request(exchange, req)
  }

  fn send_response(&self,
                   next: &Next,
                   exchange: &Exchange,
                   mut resp: Response)
                   -> Result<(), Error> {
    let current = exchange.current_request();

    match resp.msg().ty {
      | None => {
        let ty = match current.as_ref() {
          | Some(req) if req.msg().is_con() && !req.msg().is_acknowledged() => {
            req.msg().set_acknowledged();
            resp.msg_mut().id = req.msg().id;
            Type::Ack
          },
          | Some(req) if req.msg().is_con() => Type::Con,
          | _ => Type::Non,
        };
        resp.msg_mut().ty = Some(ty);
      },
      | Some(Type::Ack) | Some(Type::Reset) => {
        resp.msg_mut().id = current.as_ref().and_then(|req| req.msg().id);
      },
      | _ => (),
    }

    if resp.msg().id.is_none() {
      resp.msg_mut().id = Some(self.next_id());
    }

    exchange.sync_response(&resp);

    if resp.msg().is_con() {
      self.prepare_retransmission(next, exchange, Outbound::Response(resp.clone()));
    }

    next.send_response(exchange, resp)
  }

  fn receive_request(&self, next: &Next, exchange: &Exchange, req: Request) -> Result<(), Error> {
    if !req.msg().duplicate {
      exchange.set_current_request(req.clone());
      return next.receive_request(exchange, req);
    }

    log::debug!("duplicate request {}", msg_summary(req.msg()));

    if let Some(resp) = exchange.current_response() {
      log::debug!("responding to duplicate with {}", msg_summary(resp.msg()));
      return next.send_response(exchange, resp);
    }

    match exchange.current_request() {
      | Some(cur) if cur.msg().is_acknowledged() => {
        next.send_empty_message(exchange, EmptyMessage::ack(req.msg()))
      },
      | Some(cur) if cur.msg().is_rejected() => {
        next.send_empty_message(exchange, EmptyMessage::reset(req.msg()))
      },
      | _ => {
        log::trace!("original request has not been answered yet; dropping duplicate");
        Ok(())
      },
    }
  }

  fn receive_response(&self,
                      next: &Next,
                      exchange: &Exchange,
                      resp: Response)
                      -> Result<(), Error> {
    if let Some(req) = exchange.current_request().or_else(|| exchange.request()) {
      req.msg().set_acknowledged();
    }
    let ctx = exchange.map_mut(|s| s.retransmission.take());
    drop(ctx);

    let cancelled = exchange.request()
                            .map(|req| req.msg().is_cancelled())
                            .unwrap_or(false);
    if resp.msg().is_con() && !cancelled {
      log::trace!("acknowledging {}", msg_summary(resp.msg()));
      next.send_empty_message(exchange, EmptyMessage::ack(resp.msg()))?;
    }

    if resp.msg().duplicate {
      log::debug!("dropping duplicate response {}", msg_summary(resp.msg()));
      return Ok(());
    }

    next.receive_response(exchange, resp)
  }

  fn receive_empty_message(&self,
                           next: &Next,
                           exchange: &Exchange,
                           msg: EmptyMessage)
                           -> Result<(), Error> {
    let ctx = exchange.map_mut(|s| s.retransmission.take());
    drop(ctx);

    let target: Option<Message> = match exchange.origin() {
      | Origin::Local => exchange.current_request()
                                 .or_else(|| exchange.request())
                                 .map(Message::from),
      | Origin::Remote => exchange.current_response()
                                  .or_else(|| exchange.response())
                                  .map(Message::from),
    };

    match (msg.ty(), target) {
      | (Some(Type::Ack), Some(m)) => {
        log::trace!("{} acknowledged", msg_summary(&m));
        m.set_acknowledged();
      },
      | (Some(Type::Reset), Some(m)) => {
        log::debug!("{} rejected", msg_summary(&m));
        m.set_rejected();
      },
      | (ty, _) => log::warn!("unexpected empty {:?} for exchange {:?}", ty, exchange),
    }

    next.receive_empty_message(exchange, msg)
  }
}

#[cfg(test)]
mod test {
  use embedded_time::duration::Milliseconds;

  use super::*;
  use crate::config::Config;
  use crate::resp::code;
  use crate::test::{self, Harness};

  fn harness(max_retransmit: u16) -> Harness {
    let mut config = Config::default();
    config.msg.use_random_id_start = false;
    config.msg.con.max_retransmit = max_retransmit;

    let h = Harness::new(config);
    let layer = Reliability::new(h.config.clone(), h.dyn_scheduler());
    h.stack
     .chain()
     .add_last("reliability", Arc::new(layer))
     .unwrap();
    h
  }

  fn with_token(mut req: Request) -> Request {
    req.msg_mut().token = Some(crate::msg::token_from_u32(1));
    req
  }

  #[test]
  fn requests_default_to_con_with_fresh_ids() {
    let h = harness(4);
    let (a, b) = (h.exchange(Origin::Local), h.exchange(Origin::Local));
    h.stack.send_request(&a, Request::get("a")).unwrap();
    h.stack.send_request(&b, Request::get("b")).unwrap();

    let sent = h.outbox.requests();
    assert_eq!(sent[0].msg().ty, Some(Type::Con));
    assert_eq!(sent[0].msg().id, Some(Id(0)));
    assert_eq!(sent[1].msg().id, Some(Id(1)));
    assert_eq!(a.request().and_then(|r| r.msg().id), Some(Id(0)));
    assert!(a.is_retransmitting());
  }

  #[test]
  fn con_request_backs_off_then_times_out() {
    let h = harness(3);
    let ex = h.exchange(Origin::Local);
    h.stack.send_request(&ex, with_token(Request::get("a"))).unwrap();
    let req = ex.request().unwrap();

    h.advance(120_000);

    assert_eq!(h.outbox.requests().len(), 4);
    assert!(h.outbox
             .requests()
             .iter()
             .all(|r| r.msg().same_instance(req.msg())));
    assert!(ex.is_timed_out());
    assert!(req.msg().is_timed_out());
    assert!(!ex.is_retransmitting());

    let delays = h.scheduler.scheduled();
    assert_eq!(delays.len(), 4);
    assert!(delays[0] >= Milliseconds(2_000u64) && delays[0] <= Milliseconds(3_000u64));
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(delays[1], Milliseconds(delays[0].0 * 2));
  }

  #[test]
  fn ack_stops_retransmission() {
    let h = harness(4);
    let ex = h.exchange(Origin::Local);
    h.stack.send_request(&ex, with_token(Request::get("a"))).unwrap();
    let sent = h.outbox.requests()[0].clone();

    h.stack
     .receive_empty_message(&ex, EmptyMessage::ack(sent.msg()))
     .unwrap();
    h.advance(120_000);

    assert_eq!(h.outbox.requests().len(), 1);
    assert!(sent.msg().is_acknowledged());
    assert!(!ex.is_retransmitting());
    assert!(!ex.is_timed_out());
  }

  #[test]
  fn reset_rejects_request() {
    let h = harness(4);
    let ex = h.exchange(Origin::Local);
    h.stack.send_request(&ex, with_token(Request::get("a"))).unwrap();
    let sent = h.outbox.requests()[0].clone();

    h.stack
     .receive_empty_message(&ex, EmptyMessage::reset(sent.msg()))
     .unwrap();

    assert!(sent.msg().is_rejected());
    assert!(!ex.is_retransmitting());
  }

  #[test]
  fn cancelled_request_is_not_retransmitted() {
    let h = harness(4);
    let ex = h.exchange(Origin::Local);
    h.stack.send_request(&ex, with_token(Request::get("a"))).unwrap();

    ex.request().unwrap().msg().set_cancelled();
    h.advance(120_000);

    assert_eq!(h.outbox.requests().len(), 1);
    assert!(!ex.is_timed_out());
  }

  #[test]
  fn completing_the_exchange_cancels_retransmission() {
    let h = harness(4);
    let ex = h.exchange(Origin::Local);
    h.stack.send_request(&ex, with_token(Request::get("a"))).unwrap();

    assert!(ex.complete());
    assert!(!ex.complete());
    h.advance(120_000);

    assert_eq!(h.outbox.requests().len(), 1);
    assert_eq!(h.scheduler.pending(), 0);
  }

  #[test]
  fn response_piggybacks_then_goes_separate() {
    let h = harness(4);
    let ex = h.exchange(Origin::Remote);
    let req = test::con_request(7, 1);
    h.stack.receive_request(&ex, req.clone()).unwrap();

    h.stack
     .send_response(&ex, Response::for_request(&req, code::CONTENT))
     .unwrap();
    h.stack
     .send_response(&ex, Response::for_request(&req, code::CONTENT))
     .unwrap();

    let sent = h.outbox.responses();
    assert_eq!(sent[0].msg().ty, Some(Type::Ack));
    assert_eq!(sent[0].msg().id, Some(Id(7)));
    assert_eq!(sent[1].msg().ty, Some(Type::Con));
    assert_ne!(sent[1].msg().id, Some(Id(7)));
    assert!(req.msg().is_acknowledged());
  }

  #[test]
  fn non_request_gets_non_response() {
    let h = harness(4);
    let ex = h.exchange(Origin::Remote);
    let mut req = test::con_request(7, 1);
    req.msg_mut().ty = Some(Type::Non);
    h.stack.receive_request(&ex, req.clone()).unwrap();

    h.stack
     .send_response(&ex, Response::for_request(&req, code::CONTENT))
     .unwrap();

    assert_eq!(h.outbox.responses()[0].msg().ty, Some(Type::Non));
    assert!(!ex.is_retransmitting());
  }

  #[test]
  fn duplicate_request_gets_the_same_response() {
    let h = harness(4);
    let ex = h.exchange(Origin::Remote);
    let req = test::con_request(7, 1);
    h.stack.receive_request(&ex, req.clone()).unwrap();

    let mut resp = Response::for_request(&req, code::CONTENT);
    resp.set_payload(b"hi".iter().copied());
    ex.set_current_response(resp.clone());
    h.stack.send_response(&ex, resp).unwrap();

    let mut dup = test::con_request(7, 1);
    dup.msg_mut().duplicate = true;
    h.stack.receive_request(&ex, dup).unwrap();

    let sent = h.outbox.responses();
    assert_eq!(sent.len(), 2);
    assert!(sent[0].msg().same_instance(sent[1].msg()));
    assert_eq!(sent[1].msg().ty, Some(Type::Ack));
    assert_eq!(sent[1].msg().id, Some(Id(7)));
    assert_eq!(h.deliverer.requests().len(), 1);
  }

  #[test]
  fn duplicate_request_replays_the_response_through_the_full_stack() {
    let mut config = Config::default();
    config.msg.use_random_id_start = false;
    let h = Harness::full(config);
    let ex = h.exchange(Origin::Remote);
    let req = test::con_request(7, 1);
    h.stack.receive_request(&ex, req.clone()).unwrap();

    let mut resp = Response::for_request(&req, code::CONTENT);
    resp.set_payload(b"hi".iter().copied());
    h.stack.send_response(&ex, resp).unwrap();

    let mut dup = test::con_request(7, 1);
    dup.msg_mut().duplicate = true;
    h.stack.receive_request(&ex, dup).unwrap();

    let sent = h.outbox.responses();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].msg().payload, b"hi".to_vec());
    assert_eq!(sent[1].msg().ty, Some(Type::Ack));
    assert_eq!(sent[1].msg().id, Some(Id(7)));
    assert_eq!(sent[1].msg().token, sent[0].msg().token);
    assert_eq!(sent[1].msg().payload, sent[0].msg().payload);
    assert_eq!(h.deliverer.requests().len(), 1);
  }

  #[test]
  fn duplicate_request_without_response() {
    let h = harness(4);
    let ex = h.exchange(Origin::Remote);
    let req = test::con_request(7, 1);
    h.stack.receive_request(&ex, req.clone()).unwrap();

    let mut dup = test::con_request(7, 1);
    dup.msg_mut().duplicate = true;

    h.stack.receive_request(&ex, dup.clone()).unwrap();
    assert!(h.outbox.sent().is_empty());

    req.msg().set_acknowledged();
    h.stack.receive_request(&ex, dup.clone()).unwrap();
    assert_eq!(h.outbox.empties()[0].ty(), Some(Type::Ack));
    assert_eq!(h.outbox.empties()[0].msg().id, Some(Id(7)));

    let ex = h.exchange(Origin::Remote);
    let req = test::con_request(8, 1);
    h.stack.receive_request(&ex, req.clone()).unwrap();
    req.msg().set_rejected();
    h.stack.receive_request(&ex, dup).unwrap();
    assert_eq!(h.outbox.empties()[1].ty(), Some(Type::Reset));
  }

  #[test]
  fn con_responses_are_acknowledged_and_duplicates_dropped() {
    let h = harness(4);
    let ex = h.exchange(Origin::Local);
    h.stack.send_request(&ex, with_token(Request::get("a"))).unwrap();
    let sent = h.outbox.requests()[0].clone();

    let mut resp = Response::new(code::CONTENT);
    resp.msg_mut().ty = Some(Type::Con);
    resp.msg_mut().id = Some(Id(500));
    resp.msg_mut().token = sent.msg().token;
    h.stack.receive_response(&ex, resp.clone()).unwrap();

    assert!(sent.msg().is_acknowledged());
    assert!(!ex.is_retransmitting());
    assert_eq!(h.outbox.empties()[0].ty(), Some(Type::Ack));
    assert_eq!(h.outbox.empties()[0].msg().id, Some(Id(500)));
    assert_eq!(h.deliverer.responses().len(), 1);

    resp.msg_mut().duplicate = true;
    h.stack.receive_response(&ex, resp).unwrap();
    assert_eq!(h.outbox.empties().len(), 2);
    assert_eq!(h.deliverer.responses().len(), 1);
  }
}
