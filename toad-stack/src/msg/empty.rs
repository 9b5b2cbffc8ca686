use toad_msg::{Code, Type};

use super::{empty_token, Message};

/// A message with code 0.00, used to acknowledge or reject a peer's message
#[derive(Clone, Debug)]
pub struct EmptyMessage(Message);

impl EmptyMessage {
  fn answering(peer: &Message, ty: Type) -> Self {
    let mut msg = Message::new(Code::new(0, 0));
    msg.ty = Some(ty);
    msg.id = peer.id;
    msg.token = Some(empty_token());
    msg.destination = peer.source;
    Self(msg)
  }

  /// An ACK for `peer`, using its message ID
  pub fn ack(peer: &Message) -> Self {
    Self::answering(peer, Type::Ack)
  }

  /// A RST for `peer`, using its message ID
  pub fn reset(peer: &Message) -> Self {
    Self::answering(peer, Type::Reset)
  }

  #[allow(missing_docs)]
  pub fn ty(&self) -> Option<Type> {
    self.0.ty
  }

  /// Obtain a reference to the inner message
  pub fn msg(&self) -> &Message {
    &self.0
  }

  /// Obtain a mutable reference to the inner message
  pub fn msg_mut(&mut self) -> &mut Message {
    &mut self.0
  }
}

impl From<Message> for EmptyMessage {
  fn from(msg: Message) -> Self {
    Self(msg)
  }
}

#[cfg(test)]
mod test {
  use toad_msg::Id;

  use super::*;

  #[test]
  fn copies_peer_id() {
    let mut peer = Message::new(Code::GET);
    peer.id = Some(Id(12));
    peer.source = Some("127.0.0.1:5683".parse().unwrap());

    let ack = EmptyMessage::ack(&peer);
    assert_eq!(ack.ty(), Some(Type::Ack));
    assert_eq!(ack.msg().id, Some(Id(12)));
    assert_eq!(ack.msg().destination, peer.source);
    assert_eq!(ack.msg().token, Some(empty_token()));

    let rst = EmptyMessage::reset(&peer);
    assert_eq!(rst.ty(), Some(Type::Reset));
    assert_eq!(rst.msg().id, Some(Id(12)));
  }
}
