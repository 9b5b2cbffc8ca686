use crate::msg::Message;
use crate::resp::code::to_human;

/// One-line description of a message, for log lines
pub(crate) fn msg_summary(msg: &Message) -> String {
  let id = msg.id.map(|id| id.0.to_string()).unwrap_or_else(|| "-".into());
  format!("{:?} {} (id {}) with {} byte payload",
          msg.ty,
          to_human(msg.code),
          id,
          msg.payload_size())
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::msg::{Id, Type};
  use crate::resp::code;

  #[test]
  fn summary() {
    let mut msg = Message::new(code::CONTENT);
    msg.ty = Some(Type::Ack);
    msg.id = Some(Id(12));
    msg.payload = vec![0; 3];

    let s = msg_summary(&msg);
    assert!(s.contains("Ack"));
    assert!(s.contains("2.05"));
    assert!(s.contains("id 12"));
    assert!(s.contains("3 byte"));
  }
}
