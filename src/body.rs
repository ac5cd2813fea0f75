use std::fmt;
use std::ops::Deref;

use bytes::Bytes;

/// A message body as it travels on the wire.
#[derive(Clone, PartialEq, Default)]
pub struct Body {
  inner: Bytes,
}

impl Body {
  /// Body content as lossy UTF-8.
  pub fn to_string_lossy(&self) -> String {
    String::from_utf8_lossy(&self.inner).into_owned()
  }
}

impl Deref for Body {
  type Target = Bytes;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl AsRef<[u8]> for Body {
  fn as_ref(&self) -> &[u8] {
    &self.inner
  }
}

impl From<Bytes> for Body {
  #[inline]
  fn from(b: Bytes) -> Body {
    Body { inner: b }
  }
}

impl From<String> for Body {
  #[inline]
  fn from(s: String) -> Body {
    s.into_bytes().into()
  }
}

impl From<&'static str> for Body {
  #[inline]
  fn from(s: &'static str) -> Body {
    Body {
      inner: Bytes::from_static(s.as_bytes()),
    }
  }
}

impl From<&'static [u8]> for Body {
  #[inline]
  fn from(s: &'static [u8]) -> Body {
    Body {
      inner: Bytes::from_static(s),
    }
  }
}

impl From<Vec<u8>> for Body {
  #[inline]
  fn from(v: Vec<u8>) -> Body {
    Body { inner: v.into() }
  }
}

impl From<()> for Body {
  #[inline]
  fn from(_: ()) -> Body {
    Body::default()
  }
}

impl fmt::Debug for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match std::str::from_utf8(&self.inner) {
      Ok(s) => fmt::Debug::fmt(s, f),
      Err(_err) => fmt::Debug::fmt(&self.inner, f),
    }
  }
}

impl fmt::Display for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match std::str::from_utf8(&self.inner) {
      Ok(s) => fmt::Display::fmt(s, f),
      Err(_err) => fmt::Debug::fmt(&self.inner, f),
    }
  }
}
