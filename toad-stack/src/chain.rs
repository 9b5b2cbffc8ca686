use core::any::Any;
use std::sync::Arc;

use toad_stem::Stem;

/// Name of the sentinel entry at the top of every chain
pub const HEAD: &str = "head";

/// Name of the sentinel entry at the bottom of every chain
pub const TAIL: &str = "tail";

/// Allows looking up trait objects by their concrete type
pub trait AsAny {
  #[allow(missing_docs)]
  fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
  fn as_any(&self) -> &dyn Any {
    self
  }
}

/// Errors encounterable while editing a [`Chain`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
  /// An entry with this name already exists
  NameCollision(String),
  /// No entry with this name exists
  NotFound(String),
  /// The head and tail sentinels cannot be removed, replaced,
  /// or have entries inserted outside of them
  Sentinel(String),
}

impl core::fmt::Display for Error {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    match self {
      | Self::NameCollision(n) => write!(f, "an entry named {:?} already exists", n),
      | Self::NotFound(n) => write!(f, "no entry named {:?}", n),
      | Self::Sentinel(n) => write!(f, "{:?} is a sentinel entry", n),
    }
  }
}

impl std::error::Error for Error {}

/// A named entry of a [`Chain`]
pub struct Entry<F: ?Sized> {
  name: Arc<str>,
  filter: Arc<F>,
}

impl<F: ?Sized> Entry<F> {
  #[allow(missing_docs)]
  pub fn name(&self) -> &str {
    &self.name
  }

  #[allow(missing_docs)]
  pub fn filter(&self) -> &Arc<F> {
    &self.filter
  }

  fn is_sentinel(&self) -> bool {
    is_sentinel(&self.name)
  }
}

impl<F: ?Sized> Clone for Entry<F> {
  fn clone(&self) -> Self {
    Self { name: self.name.clone(),
           filter: self.filter.clone() }
  }
}

impl<F: ?Sized> core::fmt::Debug for Entry<F> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_tuple("Entry").field(&self.name).finish()
  }
}

fn is_sentinel(name: &str) -> bool {
  name == HEAD || name == TAIL
}

/// An immutable view of a chain's entries, head first
pub type Snapshot<F> = Arc<Vec<Entry<F>>>;

/// A named, ordered list of filters between a head and a tail sentinel.
///
/// Edits never disturb a [`Snapshot`] taken before them, so a call
/// travelling through the chain keeps seeing the entries it started with.
///
/// ```
/// use std::sync::Arc;
///
/// use toad_stack::chain::{self, AsAny, Chain};
///
/// trait Filter: AsAny + Send + Sync {}
///
/// struct Edge;
/// impl Filter for Edge {}
///
/// struct Gzip;
/// impl Filter for Gzip {}
///
/// let chain = Chain::<dyn Filter>::new(Arc::new(Edge), Arc::new(Edge));
/// chain.add_last("gzip", Arc::new(Gzip)).unwrap();
///
/// assert_eq!(chain.names(), vec!["gzip"]);
/// assert!(chain.get_by_type::<Gzip>().is_some());
/// assert_eq!(chain.add_first("gzip", Arc::new(Gzip)),
///            Err(chain::Error::NameCollision("gzip".into())));
/// ```
pub struct Chain<F: ?Sized> {
  entries: Stem<Snapshot<F>>,
}

impl<F: ?Sized> Chain<F> {
  /// Create a chain with no entries besides its sentinels
  pub fn new(head: Arc<F>, tail: Arc<F>) -> Self {
    let entries = vec![Entry { name: HEAD.into(),
                               filter: head },
                       Entry { name: TAIL.into(),
                               filter: tail }];
    Self { entries: Stem::new(Arc::new(entries)) }
  }

  /// The entries right now, head first
  pub fn snapshot(&self) -> Snapshot<F> {
    self.entries.map_ref(|es| es.clone())
  }

  /// Names of all entries besides the sentinels, top to bottom
  pub fn names(&self) -> Vec<String> {
    self.snapshot()
        .iter()
        .filter(|e| !e.is_sentinel())
        .map(|e| e.name().to_string())
        .collect()
  }

  /// Number of entries besides the sentinels
  pub fn len(&self) -> usize {
    self.snapshot().len() - 2
  }

  /// Are there no entries besides the sentinels?
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Is there an entry named `name`?
  pub fn contains(&self, name: &str) -> bool {
    self.get_entry(name).is_some()
  }

  /// The entry named `name`
  pub fn get_entry(&self, name: &str) -> Option<Entry<F>> {
    self.snapshot().iter().find(|e| e.name() == name).cloned()
  }

  /// The filter named `name`
  pub fn get(&self, name: &str) -> Option<Arc<F>> {
    self.get_entry(name).map(|e| e.filter)
  }

  /// The entry holding `filter`
  pub fn get_entry_by_filter(&self, filter: &Arc<F>) -> Option<Entry<F>> {
    let ptr = Arc::as_ptr(filter).cast::<()>();
    self.snapshot()
        .iter()
        .find(|e| Arc::as_ptr(&e.filter).cast::<()>() == ptr)
        .cloned()
  }

  /// The topmost entry whose filter is a `T`
  pub fn get_entry_by_type<T: Any>(&self) -> Option<Entry<F>>
    where F: AsAny
  {
    self.snapshot()
        .iter()
        .find(|e| AsAny::as_any(&*e.filter).is::<T>())
        .cloned()
  }

  /// The topmost filter that is a `T`
  pub fn get_by_type<T: Any>(&self) -> Option<Arc<F>>
    where F: AsAny
  {
    self.get_entry_by_type::<T>().map(|e| e.filter)
  }

  /// Insert directly below the head
  pub fn add_first(&self, name: impl AsRef<str>, filter: Arc<F>) -> Result<(), Error> {
    self.insert(name.as_ref(), filter, |_| Ok(1))
  }

  /// Insert directly above the tail
  pub fn add_last(&self, name: impl AsRef<str>, filter: Arc<F>) -> Result<(), Error> {
    self.insert(name.as_ref(), filter, |es| Ok(es.len() - 1))
  }

  /// Insert directly above the entry named `base`
  pub fn add_before(&self,
                    base: &str,
                    name: impl AsRef<str>,
                    filter: Arc<F>)
                    -> Result<(), Error> {
    if base == HEAD {
      return Err(Error::Sentinel(base.into()));
    }

    self.insert(name.as_ref(), filter, |es| position(es, base))
  }

  /// Insert directly below the entry named `base`
  pub fn add_after(&self,
                   base: &str,
                   name: impl AsRef<str>,
                   filter: Arc<F>)
                   -> Result<(), Error> {
    if base == TAIL {
      return Err(Error::Sentinel(base.into()));
    }

    self.insert(name.as_ref(), filter, |es| position(es, base).map(|ix| ix + 1))
  }

  /// Replace the entry named `name` with `filter` named `new_name`,
  /// yielding the filter that was replaced
  pub fn replace(&self,
                 name: &str,
                 new_name: impl AsRef<str>,
                 filter: Arc<F>)
                 -> Result<Arc<F>, Error> {
    let new_name = new_name.as_ref();
    if is_sentinel(name) {
      return Err(Error::Sentinel(name.into()));
    }

    let mut filter = Some(filter);
    self.edit(|es| {
          let ix = position(es, name)?;
          if new_name != name && position(es, new_name).is_ok() {
            return Err(Error::NameCollision(new_name.into()));
          }

          let old = es[ix].filter.clone();
          if let Some(filter) = filter.take() {
            es[ix] = Entry { name: new_name.into(),
                             filter };
          }
          Ok(old)
        })
  }

  /// Remove the entry named `name`, yielding its filter
  pub fn remove(&self, name: &str) -> Result<Arc<F>, Error> {
    if is_sentinel(name) {
      return Err(Error::Sentinel(name.into()));
    }

    self.edit(|es| position(es, name).map(|ix| es.remove(ix).filter))
  }

  fn insert(&self,
            name: &str,
            filter: Arc<F>,
            at: impl Fn(&[Entry<F>]) -> Result<usize, Error>)
            -> Result<(), Error> {
    let mut filter = Some(filter);
    self.edit(|es| {
          if position(es, name).is_ok() {
            return Err(Error::NameCollision(name.into()));
          }

          let ix = at(es)?;
          if let Some(filter) = filter.take() {
            es.insert(ix,
                      Entry { name: name.into(),
                              filter });
          }
          Ok(())
        })
  }

  fn edit<R>(&self, mut f: impl FnMut(&mut Vec<Entry<F>>) -> Result<R, Error>) -> Result<R, Error> {
    self.entries.map_mut(|snap| {
                  let mut es = Vec::clone(snap);
                  let r = f(&mut es)?;
                  *snap = Arc::new(es);
                  Ok(r)
                })
  }
}

fn position<F: ?Sized>(es: &[Entry<F>], name: &str) -> Result<usize, Error> {
  es.iter()
    .position(|e| e.name() == name)
    .ok_or_else(|| Error::NotFound(name.into()))
}

impl<F: ?Sized> core::fmt::Debug for Chain<F> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_list()
     .entries(self.snapshot().iter().map(|e| e.name().to_string()))
     .finish()
  }
}

#[cfg(test)]
mod test {
  use super::*;

  trait Filter: AsAny + Send + Sync {
    fn id(&self) -> u8;
  }

  #[derive(Debug)]
  struct A(u8);
  impl Filter for A {
    fn id(&self) -> u8 {
      self.0
    }
  }

  #[derive(Debug)]
  struct B;
  impl Filter for B {
    fn id(&self) -> u8 {
      0xB
    }
  }

  fn chain() -> Chain<dyn Filter> {
    Chain::new(Arc::new(A(0)), Arc::new(A(255)))
  }

  fn ids(c: &Chain<dyn Filter>) -> Vec<u8> {
    c.snapshot().iter().map(|e| e.filter().id()).collect()
  }

  #[test]
  fn insertion_positions() {
    let c = chain();
    c.add_last("two", Arc::new(A(2))).unwrap();
    c.add_first("one", Arc::new(A(1))).unwrap();
    c.add_after("two", "three", Arc::new(A(3))).unwrap();
    c.add_before("one", "half", Arc::new(B)).unwrap();

    assert_eq!(c.names(), vec!["half", "one", "two", "three"]);
    assert_eq!(ids(&c), vec![0, 0xB, 1, 2, 3, 255]);
    assert_eq!(c.len(), 4);
  }

  #[test]
  fn sentinels_are_fixed() {
    let c = chain();
    assert_eq!(c.remove(HEAD).err(), Some(Error::Sentinel(HEAD.into())));
    assert_eq!(c.replace(TAIL, "x", Arc::new(B)).err(),
               Some(Error::Sentinel(TAIL.into())));
    assert_eq!(c.add_before(HEAD, "x", Arc::new(B)),
               Err(Error::Sentinel(HEAD.into())));
    assert_eq!(c.add_after(TAIL, "x", Arc::new(B)),
               Err(Error::Sentinel(TAIL.into())));
    assert_eq!(c.add_last(TAIL, Arc::new(B)),
               Err(Error::NameCollision(TAIL.into())));
    assert!(c.is_empty());
  }

  #[test]
  fn missing_names() {
    let c = chain();
    assert_eq!(c.remove("nope").err(), Some(Error::NotFound("nope".into())));
    assert_eq!(c.replace("nope", "x", Arc::new(B)).err(),
               Some(Error::NotFound("nope".into())));
    assert_eq!(c.add_after("nope", "x", Arc::new(B)),
               Err(Error::NotFound("nope".into())));
    assert!(c.is_empty());
  }

  #[test]
  fn lookup() {
    let c = chain();
    let b: Arc<dyn Filter> = Arc::new(B);
    c.add_last("a", Arc::new(A(1))).unwrap();
    c.add_last("b", b.clone()).unwrap();

    assert_eq!(c.get("a").map(|f| f.id()), Some(1));
    assert_eq!(c.get_entry_by_type::<B>().map(|e| e.name().to_string()),
               Some("b".into()));
    assert_eq!(c.get_entry_by_filter(&b).map(|e| e.name().to_string()),
               Some("b".into()));
    assert_eq!(c.get_by_type::<A>().map(|f| f.id()), Some(0));
    assert!(c.contains("a"));
    assert!(!c.contains("c"));
  }

  #[test]
  fn replace_and_remove() {
    let c = chain();
    c.add_last("a", Arc::new(A(1))).unwrap();
    c.add_last("b", Arc::new(A(2))).unwrap();

    assert_eq!(c.replace("a", "b", Arc::new(B)).err(),
               Some(Error::NameCollision("b".into())));

    let old = c.replace("a", "c", Arc::new(B)).unwrap();
    assert_eq!(old.id(), 1);
    assert_eq!(c.names(), vec!["c", "b"]);

    assert_eq!(c.remove("b").map(|f| f.id()), Ok(2));
    assert_eq!(c.names(), vec!["c"]);
  }

  #[test]
  fn snapshots_survive_edits() {
    let c = chain();
    c.add_last("a", Arc::new(A(1))).unwrap();
    let before = c.snapshot();

    c.remove("a").unwrap();
    c.add_last("b", Arc::new(B)).unwrap();

    assert_eq!(before.iter().map(|e| e.name().to_string()).collect::<Vec<_>>(),
               vec![HEAD, "a", TAIL]);
    assert_eq!(c.names(), vec!["b"]);
  }
}
