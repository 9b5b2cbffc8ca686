use std::sync::Arc;

use embedded_time::duration::Milliseconds;

use super::{Error, Layer, Next};
use crate::config;
use crate::exchange::Exchange;
use crate::logging::msg_summary;
use crate::msg::{known, Block, EmptyMessage, Message, MessageObserver, Type};
use crate::req::Request;
use crate::resp::{code, Response};
use crate::time::{self, Scheduler};

/// Progress of one blockwise transfer, in either direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockwiseStatus {
  current_num: u32,
  current_szx: u8,
  content_format: Option<u16>,
  complete: bool,
  random_access: bool,
  observe: Option<u32>,
  blocks: Vec<Vec<u8>>,
}

impl BlockwiseStatus {
  /// A transfer starting at the first block
  pub fn new(content_format: Option<u16>, szx: u8) -> Self {
    Self::starting_at(content_format, 0, szx)
  }

  /// A transfer starting at block `num`
  pub fn starting_at(content_format: Option<u16>, num: u32, szx: u8) -> Self {
    Self { current_num: num,
           current_szx: szx.min(Block::MAX_SZX),
           content_format,
           complete: false,
           random_access: false,
           observe: None,
           blocks: Vec::new() }
  }

  /// The block number expected (receiving) or about to be sent (sending)
  pub fn current_num(&self) -> u32 {
    self.current_num
  }

  #[allow(missing_docs)]
  pub fn current_szx(&self) -> u8 {
    self.current_szx
  }

  /// Size in bytes of blocks with [`BlockwiseStatus::current_szx`]
  pub fn block_size(&self) -> usize {
    1 << (4 + self.current_szx)
  }

  /// Content-Format of the first block
  pub fn content_format(&self) -> Option<u16> {
    self.content_format
  }

  /// Has the last block been sent or received?
  pub fn is_complete(&self) -> bool {
    self.complete
  }

  /// Did the client ask for a single block rather than the whole body?
  pub fn is_random_access(&self) -> bool {
    self.random_access
  }

  /// Observe option of the notification being received
  pub fn observe(&self) -> Option<u32> {
    self.observe
  }

  /// Number of blocks received so far
  pub fn block_count(&self) -> usize {
    self.blocks.len()
  }

  fn add_block(&mut self, payload: &[u8]) {
    self.blocks.push(payload.to_vec());
  }

  fn assemble(&self) -> Vec<u8> {
    self.blocks.concat()
  }

  /// The bytes of `payload` in the current block, and whether more follow
  fn slice(&self, payload: &[u8]) -> (Vec<u8>, bool) {
    let size = self.block_size();
    let from = (self.current_num as usize).saturating_mul(size)
                                          .min(payload.len());
    let to = from.saturating_add(size).min(payload.len());
    (payload[from..to].to_vec(), to < payload.len())
  }
}

/// Marks a whole message timed out when one of its blocks times out
#[derive(Debug)]
struct PropagateTimeout(Message);

impl MessageObserver for PropagateTimeout {
  fn on_timed_out(&self, _: &Message) {
    self.0.set_timed_out();
  }
}

/// The current block of a request body
fn request_block(whole: &Request, status: &mut BlockwiseStatus) -> Request {
  let (payload, more) = status.slice(&whole.msg().payload);

  let mut block = Request::from(Message::new(whole.msg().code));
  let msg = block.msg_mut();
  msg.ty = Some(whole.msg().ty.unwrap_or(Type::Con));
  msg.token = whole.msg().token;
  msg.destination = whole.msg().destination;
  msg.opts = whole.msg().opts.clone();
  msg.payload = payload;
  msg.set_block1(Block::new(status.current_szx, status.current_num, more));
  block.msg()
       .set_observer(Arc::new(PropagateTimeout(whole.msg().clone())));

  status.complete = !more;
  block
}

/// The current block of a response body.
///
/// With `reuse_first`, the first block of a notification is the
/// notification itself so that it keeps its identity on the relation.
fn response_block(whole: &Response, status: &mut BlockwiseStatus, reuse_first: bool) -> Response {
  let (payload, more) = status.slice(&whole.msg().payload);
  let observe = whole.msg().has_observe();

  let mut block = if reuse_first && observe && status.current_num == 0 {
    whole.clone()
  } else {
    let mut block = Response::new(whole.code());
    let msg = block.msg_mut();
    msg.token = whole.msg().token;
    msg.destination = whole.msg().destination;
    msg.opts = whole.msg().opts.clone();
    block.msg()
         .set_observer(Arc::new(PropagateTimeout(whole.msg().clone())));
    block
  };

  block.msg_mut().payload = payload;
  block.msg_mut()
       .set_block2(Block::new(status.current_szx, status.current_num, more));
  block.set_last(!more && !observe);

  status.complete = !more;
  block
}

enum Block1Step {
  WrongNum { expected: u32 },
  ContentFormatChanged,
  Continue,
  Last(Vec<u8>),
}

enum Block2Step {
  WrongNum { expected: u32 },
  RandomAccess,
  Fetch,
  Last { payload: Vec<u8>, observe: Option<u32> },
}

/// Layer responsible for blockwise transfers ([RFC7959](https://datatracker.ietf.org/doc/html/rfc7959)).
///
/// - Request bodies larger than [`max_message_size`](config::Msg::max_message_size)
///   are sent in Block1 blocks, each sent after the previous one is acknowledged
///   by a response carrying its Block1 option.
/// - Response bodies larger than that (or whose size the peer negotiated with an
///   early Block2 option) are sent in Block2 blocks, the first one immediately and
///   the rest as the peer asks for them.
/// - Inbound Block1 requests and Block2 responses are reassembled before they
///   travel further up; Block2 responses are fetched automatically.
///
/// Every transfer in progress is abandoned (and its exchange completed) after
/// [`status_lifetime`](config::Block::status_lifetime) without progress.
#[derive(Debug)]
pub struct Blockwise {
  config: config::Shared,
  scheduler: Arc<dyn Scheduler>,
}

impl Blockwise {
  /// Create the layer
  pub fn new(config: config::Shared, scheduler: Arc<dyn Scheduler>) -> Self {
    Self { config, scheduler }
  }

  fn default_szx(&self) -> u8 {
    Block::szx_for(self.config.get().block.default_size)
  }

  /// (Re)start the timer abandoning the exchange's transfer
  fn prepare_cleanup(&self, exchange: &Exchange) {
    let lifetime = self.config.get().block.status_lifetime;
    let weak = exchange.downgrade();
    let timer = self.scheduler.after(lifetime,
                                     Box::new(move || {
                                       if let Some(ex) = weak.upgrade() {
                                         log::info!("blockwise transfer timed out; completing {:?}",
                                                    ex);
                                         ex.complete();
                                       }
                                     }));

    let mut slot = Some(timer);
    exchange.map_mut(|s| match slot.take() {
              | Some(t) if s.complete => {
                t.cancel();
              },
              | Some(t) => {
                time::cancel(&mut s.block_cleanup);
                s.block_cleanup = Some(t);
              },
              | None => (),
            });
  }

  fn clear_cleanup(&self, exchange: &Exchange) {
    exchange.map_mut(|s| time::cancel(&mut s.block_cleanup));
  }

  /// Remember the block size a peer asked for in a request's Block2 option
  fn early_negotiation(&self, exchange: &Exchange, req: &Request) {
    if let Some(b2) = req.msg().block2() {
      log::debug!("peer negotiated {} byte blocks starting at {}",
                  b2.size(),
                  b2.num());
      let status = BlockwiseStatus::starting_at(None, b2.num(), b2.szx());
      let mut status = Some(status);
      exchange.map_mut(|s| s.response_block_status = status.take());
      self.prepare_cleanup(exchange);
    }
  }

  fn incomplete(&self,
                next: &Next,
                exchange: &Exchange,
                req: &Request,
                b1: Block,
                why: &str)
                -> Result<(), Error> {
    let mut resp = Response::for_request(req, code::REQUEST_ENTITY_INCOMPLETE);
    resp.msg_mut().set_block1(b1);
    resp.set_payload(why.bytes());
    exchange.set_current_response(resp.clone());
    next.send_response(exchange, resp)
  }

  fn receive_request_block(&self,
                           next: &Next,
                           exchange: &Exchange,
                           req: Request,
                           b1: Block)
                           -> Result<(), Error> {
    log::debug!("received request block {}", b1);

    let szx = self.default_szx();
    let cf = req.msg().content_format();
    let payload = &req.msg().payload;

    let step = exchange.map_mut(|s| {
                         let st = s.request_block_status
                                   .get_or_insert_with(|| BlockwiseStatus::new(cf, szx));
                         if b1.num() == 0 && st.current_num > 0 {
                           *st = BlockwiseStatus::new(cf, szx);
                         }

                         if b1.num() != st.current_num {
                           return Block1Step::WrongNum { expected: st.current_num };
                         }
                         if cf != st.content_format {
                           return Block1Step::ContentFormatChanged;
                         }

                         st.add_block(payload);
                         st.current_num += 1;
                         st.current_szx = b1.szx();
                         if b1.more() {
                           return Block1Step::Continue;
                         }

                         let whole = st.assemble();
                         s.request_block_status = None;
                         s.block1_to_ack = Some(b1);
                         Block1Step::Last(whole)
                       });

    match step {
      | Block1Step::WrongNum { expected } => {
        log::warn!("wrong request block number: expected {}, got {}",
                   expected,
                   b1.num());
        self.incomplete(next, exchange, &req, b1, "Wrong block number")
      },
      | Block1Step::ContentFormatChanged => {
        log::warn!("Content-Format changed during blockwise request");
        self.incomplete(next, exchange, &req, b1, "Changed Content-Format")
      },
      | Block1Step::Continue => {
        self.prepare_cleanup(exchange);
        let mut resp = Response::for_request(&req, code::CONTINUE);
        resp.msg_mut()
            .set_block1(Block::new(b1.szx(), b1.num(), true));
        resp.set_last(false);
        exchange.set_current_response(resp.clone());
        next.send_response(exchange, resp)
      },
      | Block1Step::Last(payload) => {
        self.clear_cleanup(exchange);
        self.early_negotiation(exchange, &req);

        let mut whole = req;
        whole.msg_mut().payload = payload;
        whole.msg_mut().opts.remove(known::BLOCK1);
        log::debug!("reassembled {}", msg_summary(whole.msg()));

        exchange.set_request(whole.clone());
        next.receive_request(exchange, whole)
      },
    }
  }

  fn serve_block(&self,
                 next: &Next,
                 exchange: &Exchange,
                 req: Request,
                 b2: Block,
                 whole: Response)
                 -> Result<(), Error> {
    log::debug!("peer asked for block {} of {}", b2, msg_summary(whole.msg()));

    let cf = whole.msg().content_format();
    let (mut block, complete) = exchange.map_mut(|s| {
                                          let st =
                                            s.response_block_status
                                             .get_or_insert_with(|| BlockwiseStatus::new(cf, b2.szx()));
                                          st.current_num = b2.num();
                                          st.current_szx = b2.szx();
                                          let block = response_block(&whole, st, false);
                                          (block, st.complete)
                                        });

    block.msg_mut().token = req.msg().token;
    block.msg_mut().remove_observe();

    if complete {
      exchange.map_mut(|s| s.response_block_status = None);
      self.clear_cleanup(exchange);
    } else {
      self.prepare_cleanup(exchange);
    }

    exchange.set_current_response(block.clone());
    next.send_response(exchange, block)
  }

  fn send_next_request_block(&self,
                             next: &Next,
                             exchange: &Exchange,
                             resp: &Response,
                             b1: Block)
                             -> Result<(), Error> {
    let whole = match exchange.request() {
      | Some(whole) => whole,
      | None => {
        log::warn!("no request to continue sending blockwise on {:?}", exchange);
        return Ok(());
      },
    };

    let block = exchange.map_mut(|s| {
                          let st = s.request_block_status.as_mut()?;
                          let szx = b1.szx().min(st.current_szx);
                          let sent = st.block_size() / (1usize << (4 + szx));
                          st.current_num += sent as u32;
                          st.current_szx = szx;
                          Some(request_block(&whole, st))
                        });

    match block {
      | Some(mut block) => {
        if block.msg().token.is_none() {
          block.msg_mut().token = resp.msg().token;
        }

        log::debug!("sending request block {:?}", block.msg().block1());
        self.prepare_cleanup(exchange);
        exchange.set_current_request(block.clone());
        next.send_request(exchange, block)
      },
      | None => Ok(()),
    }
  }

  fn receive_response_block(&self,
                            next: &Next,
                            exchange: &Exchange,
                            resp: Response,
                            b2: Block)
                            -> Result<(), Error> {
    log::debug!("received response block {}", b2);

    let cf = resp.msg().content_format();
    let observe = resp.msg().observe();
    let payload = &resp.msg().payload;

    let step = exchange.map_mut(|s| {
                         let st = s.response_block_status
                                   .get_or_insert_with(|| BlockwiseStatus::new(cf, b2.szx()));
                         if b2.num() != st.current_num {
                           return Block2Step::WrongNum { expected: st.current_num };
                         }

                         st.add_block(payload);
                         if observe.is_some() {
                           st.observe = observe;
                         }

                         if st.random_access {
                           s.response_block_status = None;
                           return Block2Step::RandomAccess;
                         }

                         if b2.more() {
                           st.current_num = b2.num() + 1;
                           st.current_szx = b2.szx();
                           return Block2Step::Fetch;
                         }

                         let whole = st.assemble();
                         let observe = st.observe;
                         s.response_block_status = None;
                         Block2Step::Last { payload: whole,
                                            observe }
                       });

    match step {
      | Block2Step::WrongNum { expected } => {
        log::warn!("wrong response block number: expected {}, got {}; cancelling request",
                   expected,
                   b2.num());
        if resp.msg().is_con() {
          next.send_empty_message(exchange, EmptyMessage::reset(resp.msg()))?;
        }
        if let Some(req) = exchange.request() {
          req.msg().set_cancelled();
        }
        Ok(())
      },
      | Block2Step::RandomAccess => {
        self.clear_cleanup(exchange);
        exchange.set_response(resp.clone());
        next.receive_response(exchange, resp)
      },
      | Block2Step::Fetch => {
        self.prepare_cleanup(exchange);

        let base = match exchange.request().or_else(|| exchange.current_request()) {
          | Some(base) => base,
          | None => {
            log::warn!("no request to fetch further blocks with on {:?}", exchange);
            return Ok(());
          },
        };

        let mut req = Request::from(Message::new(base.msg().code));
        let msg = req.msg_mut();
        msg.ty = base.msg().ty;
        msg.destination = base.msg().destination;
        msg.opts = base.msg().opts.clone();
        msg.token = resp.msg().token;
        msg.remove_observe();
        msg.set_block2(Block::new(b2.szx(), b2.num() + 1, false));

        exchange.set_current_request(req.clone());
        next.send_request(exchange, req)
      },
      | Block2Step::Last { payload, observe } => {
        self.clear_cleanup(exchange);

        let rtt = self.scheduler
                      .now()
                      .0
                      .saturating_sub(exchange.timestamp().0);
        let mut whole = resp;
        whole.msg_mut().payload = payload;
        whole.msg_mut().opts.remove(known::BLOCK2);
        whole.set_rtt(Milliseconds(rtt));
        if let Some(n) = observe {
          whole.msg_mut().set_observe(n);
        }
        log::debug!("reassembled {}", msg_summary(whole.msg()));

        exchange.set_response(whole.clone());
        next.receive_response(exchange, whole)
      },
    }
  }
}

impl Layer for Blockwise {
  fn send_request(&self, next: &Next, exchange: &Exchange, req: Request) -> Result<(), Error> {
    let cfg = self.config.get();

    if req.method().has_body() && req.msg().payload_size() > cfg.msg.max_message_size {
      log::debug!("{} exceeds {} bytes, sending blockwise",
                  msg_summary(req.msg()),
                  cfg.msg.max_message_size);

      let szx = Block::szx_for(cfg.block.default_size);
      let cf = req.msg().content_format();
      let block = exchange.map_mut(|s| {
                            let st = s.request_block_status
                                      .insert(BlockwiseStatus::new(cf, szx));
                            request_block(&req, st)
                          });

      self.prepare_cleanup(exchange);
      exchange.set_current_request(block.clone());
      return next.send_request(exchange, block);
    }

    if let Some(b2) = req.msg().block2().filter(|b| b.num() > 0) {
      log::debug!("asking for block {} alone", b2);
      let mut status = BlockwiseStatus::starting_at(None, b2.num(), b2.szx());
      status.random_access = true;
      let mut status = Some(status);
      exchange.map_mut(|s| s.response_block_status = status.take());
      self.prepare_cleanup(exchange);
    }

    exchange.set_current_request(req.clone());
    next.send_request(exchange, req)
  }

  fn send_response(&self,
                   next: &Next,
                   exchange: &Exchange,
                   mut resp: Response)
                   -> Result<(), Error> {
    let cfg = self.config.get();
    let b1 = exchange.map_mut(|s| s.block1_to_ack.take());

    let blockwise = resp.msg().payload_size() > cfg.msg.max_message_size
                    || exchange.response_block_status().is_some();

    if !blockwise {
      if let Some(b1) = b1 {
        resp.msg_mut().set_block1(b1);
      }
      exchange.set_current_response(resp.clone());
      self.clear_cleanup(exchange);
      return next.send_response(exchange, resp);
    }

    log::debug!("sending {} blockwise", msg_summary(resp.msg()));

    let szx = Block::szx_for(cfg.block.default_size);
    let cf = resp.msg().content_format();
    let observe = resp.msg().has_observe();
    let (mut block, complete) = exchange.map_mut(|s| {
                                          let st = s.response_block_status
                                                    .get_or_insert_with(|| {
                                                      BlockwiseStatus::new(cf, szx)
                                                    });
                                          if observe {
                                            st.current_num = 0;
                                          }
                                          let block = response_block(&resp, st, true);
                                          (block, st.complete)
                                        });

    if complete {
      exchange.map_mut(|s| s.response_block_status = None);
      self.clear_cleanup(exchange);
    } else {
      self.prepare_cleanup(exchange);
    }

    if let Some(b1) = b1 {
      block.msg_mut().set_block1(b1);
    }
    if block.msg().token.is_none() {
      block.msg_mut().token = exchange.request().and_then(|r| r.msg().token);
    }

    exchange.set_current_response(block.clone());
    next.send_response(exchange, block)
  }

  fn receive_request(&self, next: &Next, exchange: &Exchange, req: Request) -> Result<(), Error> {
    if let Some(b1) = req.msg().block1() {
      return self.receive_request_block(next, exchange, req, b1);
    }

    match (req.msg().block2(), exchange.response()) {
      | (Some(b2), Some(whole)) => self.serve_block(next, exchange, req, b2, whole),
      | _ => {
        self.early_negotiation(exchange, &req);
        exchange.set_request(req.clone());
        next.receive_request(exchange, req)
      },
    }
  }

  fn receive_response(&self,
                      next: &Next,
                      exchange: &Exchange,
                      resp: Response)
                      -> Result<(), Error> {
    let cancelled = exchange.request()
                            .map(|r| r.msg().is_cancelled())
                            .unwrap_or(false);
    if cancelled {
      if resp.msg().ty != Some(Type::Ack) {
        log::debug!("rejecting {} to cancelled request", msg_summary(resp.msg()));
        return next.send_empty_message(exchange, EmptyMessage::reset(resp.msg()));
      }
      return Ok(());
    }

    let (b1, b2) = (resp.msg().block1(), resp.msg().block2());

    if let Some(b1) = b1 {
      log::debug!("peer acknowledged request block {}", b1);
      match exchange.request_block_status() {
        | Some(st) if !st.is_complete() => {
          return self.send_next_request_block(next, exchange, &resp, b1)
        },
        | Some(_) => {
          exchange.map_mut(|s| s.request_block_status = None);
          self.clear_cleanup(exchange);
        },
        | None => (),
      }
    }

    match b2 {
      | Some(b2) => self.receive_response_block(next, exchange, resp, b2),
      | None => next.receive_response(exchange, resp),
    }
  }
}
