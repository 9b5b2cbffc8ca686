use toad_msg::{OptNumber, OptValue};

/// Option numbers interpreted by the stack
pub mod known {
  use toad_msg::OptNumber;

  /// Uri-Host
  pub const URI_HOST: OptNumber = OptNumber(3);
  /// ETag
  pub const ETAG: OptNumber = OptNumber(4);
  /// [Observe](https://www.rfc-editor.org/rfc/rfc7641#section-2)
  pub const OBSERVE: OptNumber = OptNumber(6);
  /// Uri-Path
  pub const URI_PATH: OptNumber = OptNumber(11);
  /// Content-Format
  pub const CONTENT_FORMAT: OptNumber = OptNumber(12);
  /// Max-Age
  pub const MAX_AGE: OptNumber = OptNumber(14);
  /// Uri-Query
  pub const URI_QUERY: OptNumber = OptNumber(15);
  /// Accept
  pub const ACCEPT: OptNumber = OptNumber(17);
  /// [Block2](https://www.rfc-editor.org/rfc/rfc7959#section-2.1), describes a block of the response payload
  pub const BLOCK2: OptNumber = OptNumber(23);
  /// [Block1](https://www.rfc-editor.org/rfc/rfc7959#section-2.1), describes a block of the request payload
  pub const BLOCK1: OptNumber = OptNumber(27);
  /// Size2
  pub const SIZE2: OptNumber = OptNumber(28);
  /// Size1
  pub const SIZE1: OptNumber = OptNumber(60);
}

/// Max-Age assumed when a message has no Max-Age option, in seconds.
pub const DEFAULT_MAX_AGE: u32 = 60;

/// A single option
#[derive(Clone, Debug, PartialEq)]
pub struct Opt {
  /// Option number
  pub number: OptNumber,
  /// Option value
  pub value: OptValue<Vec<u8>>,
}

/// Ordered multimap of options.
///
/// Options are kept sorted by option number, and options sharing a number
/// stay in the order they were added.
///
/// ```
/// use toad_msg::{OptNumber, OptValue};
/// use toad_stack::msg::Options;
///
/// let mut opts = Options::default();
/// opts.add(OptNumber(11), OptValue(b"b".to_vec()));
/// opts.add(OptNumber(3), OptValue(b"host".to_vec()));
/// opts.add(OptNumber(11), OptValue(b"c".to_vec()));
///
/// let numbers = opts.iter().map(|o| o.number.0).collect::<Vec<_>>();
/// assert_eq!(numbers, vec![3, 11, 11]);
/// assert_eq!(opts.first(OptNumber(11)).map(|v| v.0.clone()), Some(b"b".to_vec()));
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Options(Vec<Opt>);

impl Options {
  /// Iterate over all options
  pub fn iter(&self) -> core::slice::Iter<'_, Opt> {
    self.0.iter()
  }

  /// How many option values are there?
  pub fn len(&self) -> usize {
    self.0.len()
  }

  /// Are there no options?
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// All values for option `n`, in insertion order
  pub fn get(&self, n: OptNumber) -> impl Iterator<Item = &OptValue<Vec<u8>>> {
    self.0.iter().filter(move |o| o.number == n).map(|o| &o.value)
  }

  /// The first value for option `n`
  pub fn first(&self, n: OptNumber) -> Option<&OptValue<Vec<u8>>> {
    self.get(n).next()
  }

  /// Is there at least one value for option `n`?
  pub fn has(&self, n: OptNumber) -> bool {
    self.first(n).is_some()
  }

  /// Add a value for option `n` after any existing values for it
  pub fn add(&mut self, n: OptNumber, v: OptValue<Vec<u8>>) {
    let ix = self.0
                 .iter()
                 .position(|o| o.number.0 > n.0)
                 .unwrap_or(self.0.len());
    self.0.insert(ix, Opt { number: n, value: v });
  }

  /// Replace all values for option `n` with `v`
  pub fn set(&mut self, n: OptNumber, v: OptValue<Vec<u8>>) {
    self.remove(n);
    self.add(n, v);
  }

  /// Remove all values for option `n`, yielding whether any were removed
  pub fn remove(&mut self, n: OptNumber) -> bool {
    let before = self.0.len();
    self.0.retain(|o| o.number != n);
    before != self.0.len()
  }

  /// Interpret the first value for option `n` as an unsigned integer
  pub fn get_u32(&self, n: OptNumber) -> Option<u32> {
    self.first(n).map(|v| decode_uint(&v.0))
  }

  /// Replace all values for option `n` with an unsigned integer
  pub fn set_u32(&mut self, n: OptNumber, v: u32) {
    self.set(n, OptValue(encode_uint(v)))
  }
}

/// Encode an unsigned integer option value using the fewest bytes possible.
///
/// Zero is encoded as an empty value.
pub fn encode_uint(n: u32) -> Vec<u8> {
  let bytes = n.to_be_bytes();
  let skip = bytes.iter().take_while(|b| **b == 0).count();
  bytes[skip..].to_vec()
}

/// Decode an unsigned integer option value.
///
/// Values longer than 4 bytes are truncated to their last 4 bytes.
pub fn decode_uint(bytes: &[u8]) -> u32 {
  let start = bytes.len().saturating_sub(4);
  bytes[start..].iter()
                .fold(0u32, |n, b| (n << 8) | u32::from(*b))
}

/// Three items of information may need to be transferred in a
/// Block (Block1 or Block2) option:
/// * the size exponent of the block ([`Block::szx`])
/// * whether more blocks are following ([`Block::more`])
/// * the relative number of the block ([`Block::num`]) within a sequence of blocks with the given size.
///
/// ```
/// use toad_stack::msg::Block;
///
/// let b = Block::new(Block::szx_for(64), 3, true);
/// assert_eq!(b.size(), 64);
/// assert_eq!(b.num(), 3);
/// assert!(b.more());
/// assert_eq!(u32::from(b), 3 << 4 | 1 << 3 | 2);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block(u32);

impl Block {
  /// Largest legal size exponent (1024 byte blocks)
  pub const MAX_SZX: u8 = 6;

  /// Create a block option value
  pub fn new(szx: u8, num: u32, more: bool) -> Self {
    let num = num << 4;
    let more = u32::from(more) << 3;
    let szx = u32::from(szx.min(Self::MAX_SZX));

    Self(num | more | szx)
  }

  /// Size exponent, block size is `2^(4 + szx)`
  pub fn szx(&self) -> u8 {
    ((self.0 & 0b111) as u8).min(Self::MAX_SZX)
  }

  /// Block size in bytes
  pub fn size(&self) -> usize {
    1 << (4 + self.szx())
  }

  #[allow(missing_docs)]
  pub fn more(&self) -> bool {
    (self.0 & 0b1000) >> 3 == 1
  }

  #[allow(missing_docs)]
  pub fn num(&self) -> u32 {
    self.0 >> 4
  }

  /// Size exponent of the largest legal block size not exceeding `size`
  pub fn szx_for(size: usize) -> u8 {
    let size = size.clamp(16, 1024);
    let log2 = usize::BITS - 1 - size.leading_zeros();
    (log2 - 4) as u8
  }
}

impl From<Block> for u32 {
  fn from(b: Block) -> Self {
    b.0
  }
}

impl From<u32> for Block {
  fn from(n: u32) -> Self {
    Block(n)
  }
}

impl core::fmt::Display for Block {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    write!(f, "(szx={}/{}, m={}, num={})", self.szx(), self.size(), self.more(), self.num())
  }
}
