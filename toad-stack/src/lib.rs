//! `toad-stack` is the transmission pipeline of a CoAP endpoint.
//!
//! Every message an endpoint sends or receives travels through a
//! [`Stack`](layer::Stack) of [`Layer`](layer::Layer)s, each one
//! responsible for one part of the protocol:
//!
//! - [`Observe`](layer::Observe) registers and re-registers observe
//!   relations, and orders notifications
//!   ([RFC7641](https://www.rfc-editor.org/rfc/rfc7641))
//! - [`Blockwise`](layer::Blockwise) splits and reassembles large bodies
//!   ([RFC7959](https://www.rfc-editor.org/rfc/rfc7959))
//! - [`ProvisionTokens`](layer::ProvisionTokens) gives outbound requests a token
//! - [`Reliability`](layer::Reliability) assigns message IDs, acknowledges,
//!   deduplicates and retransmits confirmable messages
//!   ([RFC7252 section 4](https://www.rfc-editor.org/rfc/rfc7252#section-4))
//!
//! Outbound calls enter the stack at the top and leave it through an
//! [`Outbox`](exchange::Outbox); inbound calls enter at the bottom and
//! reach the application through a [`Deliverer`](exchange::Deliverer).
//! The state a request and its responses share lives on an
//! [`Exchange`](exchange::Exchange).
//!
//! ## Layers are a chain
//! Where a static pipeline would encode its steps in types, the stack is a
//! [`Chain`](chain::Chain) of named, reference-counted layers that can be
//! added, replaced or removed while messages are moving through it.
//!
//! ## Time
//! Retransmissions, re-registrations and cleanup are scheduled on a
//! [`Scheduler`](time::Scheduler). [`std::Scheduler`](crate::std::Scheduler)
//! runs tasks on a timer thread; tests drive a manual one.

// x-release-please-version
#![doc(html_root_url = "https://docs.rs/toad-stack/0.1.0")]
// x-release-please-end
#![cfg_attr(any(docsrs, feature = "docs"), feature(doc_cfg))]
// -
// style
#![allow(clippy::unused_unit)]
// -
// deny
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![deny(missing_copy_implementations)]
#![cfg_attr(not(test), deny(unsafe_code))]
// -
// warnings
#![cfg_attr(not(test), warn(unreachable_pub))]

#[cfg(test)]
pub(crate) mod test;

pub(crate) mod logging;

/// CoAP messages and their lifecycle
pub mod msg;

/// Requests
pub mod req;

/// Responses
pub mod resp;

/// configuring runtime behavior
pub mod config;

/// time abstractions
pub mod time;

/// retransmission state of confirmable messages
pub mod retry;

/// The shared state of a request and its responses
pub mod exchange;

/// An ordered, editable list of named handlers
pub mod chain;

/// The layers of the transmission pipeline
pub mod layer;

/// Observe relations (server side)
pub mod relation;

/// `std`-only toad stuff
#[cfg(feature = "std")]
#[cfg_attr(docsrs, doc(cfg(feature = "std")))]
pub mod std;

macro_rules! code {
  (rfc7252($section:literal) $name:ident = $c:literal * $d:literal) => {
    #[doc = toad_macros::rfc_7252_doc!($section)]
    #[allow(clippy::zero_prefixed_literal)]
    pub const $name: toad_msg::Code = toad_msg::Code::new($c, $d);
  };
  (rfc7252($section:literal) $name:ident = $newtype:tt($c:literal * $d:literal)) => {
    #[doc = toad_macros::rfc_7252_doc!($section)]
    #[allow(clippy::zero_prefixed_literal)]
    pub const $name: $newtype = $newtype(toad_msg::Code::new($c, $d));
  };
  (#[doc = $doc:expr] $name:ident = $c:literal * $d:literal) => {
    #[doc = $doc]
    #[allow(clippy::zero_prefixed_literal)]
    pub const $name: toad_msg::Code = toad_msg::Code::new($c, $d);
  };
}

pub(crate) use code;
