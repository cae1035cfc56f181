//! URI template expansion against an optional base URI.
//!
//! Templates use `{name}` placeholders. Values come either positionally
//! (arrays, slices, vectors, tuples) where the n-th placeholder takes the n-th
//! value, or by name (`HashMap`, `BTreeMap`). Expanded values are percent
//! encoded so they cannot introduce path separators or query delimiters.

use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::hash::{BuildHasher, Hash};

use url::Url;

use crate::error::ClientError;

/// Source of values for URI template placeholders.
pub trait UriVariables {
    /// Value for the placeholder at position `index` named `name`.
    fn value(&self, index: usize, name: &str) -> Option<String>;
}

impl UriVariables for () {
    fn value(&self, _index: usize, _name: &str) -> Option<String> {
        None
    }
}

impl<T: Display> UriVariables for [T] {
    fn value(&self, index: usize, _name: &str) -> Option<String> {
        self.get(index).map(ToString::to_string)
    }
}

impl<T: Display, const N: usize> UriVariables for [T; N] {
    fn value(&self, index: usize, name: &str) -> Option<String> {
        self.as_slice().value(index, name)
    }
}

impl<T: Display> UriVariables for Vec<T> {
    fn value(&self, index: usize, name: &str) -> Option<String> {
        self.as_slice().value(index, name)
    }
}

impl<V: UriVariables + ?Sized> UriVariables for &V {
    fn value(&self, index: usize, name: &str) -> Option<String> {
        (**self).value(index, name)
    }
}

impl<K, V, S> UriVariables for HashMap<K, V, S>
where
    K: Borrow<str> + Eq + Hash,
    V: Display,
    S: BuildHasher,
{
    fn value(&self, _index: usize, name: &str) -> Option<String> {
        self.get(name).map(ToString::to_string)
    }
}

impl<K, V> UriVariables for BTreeMap<K, V>
where
    K: Borrow<str> + Ord,
    V: Display,
{
    fn value(&self, _index: usize, name: &str) -> Option<String> {
        self.get(name).map(ToString::to_string)
    }
}

macro_rules! tuple_variables {
    ($($idx:tt => $ty:ident),+) => {
        impl<$($ty: Display),+> UriVariables for ($($ty,)+) {
            fn value(&self, index: usize, _name: &str) -> Option<String> {
                match index {
                    $($idx => Some(self.$idx.to_string()),)+
                    _ => None,
                }
            }
        }
    };
}

tuple_variables!(0 => A);
tuple_variables!(0 => A, 1 => B);
tuple_variables!(0 => A, 1 => B, 2 => C);
tuple_variables!(0 => A, 1 => B, 2 => C, 3 => D);

/// Expand every `{name}` placeholder in `template`.
///
/// # Errors
/// Returns [`ClientError::UriResolution`] when a placeholder has no value or
/// a brace is left unclosed.
pub fn expand(template: &str, vars: &(impl UriVariables + ?Sized)) -> Result<String, ClientError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut index = 0;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| {
            ClientError::UriResolution(format!("unclosed variable in URI template '{template}'"))
        })?;
        let spec = &after[..close];
        // `{id:\d+}` style patterns: only the name matters here
        let name = spec.split(':').next().unwrap_or(spec).trim();
        let value = vars.value(index, name).ok_or_else(|| {
            ClientError::UriResolution(format!(
                "not enough variable values available to expand '{name}' in '{template}'"
            ))
        })?;
        out.push_str(&urlencoding::encode(&value));
        index += 1;
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Resolves request URIs, relative ones against a base.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UriResolver {
    base: Option<Url>,
}

impl UriResolver {
    #[must_use]
    pub fn new(base: Option<Url>) -> Self {
        Self { base }
    }

    /// Parse a base URI.
    ///
    /// # Errors
    /// Returns [`ClientError::UriResolution`] if `base` is not an absolute URL.
    pub fn with_base(base: &str) -> Result<Self, ClientError> {
        let url = Url::parse(base)
            .map_err(|e| ClientError::UriResolution(format!("invalid base URI '{base}': {e}")))?;
        if url.cannot_be_a_base() {
            return Err(ClientError::UriResolution(format!(
                "base URI '{base}' cannot carry a path"
            )));
        }
        Ok(Self { base: Some(url) })
    }

    #[must_use]
    pub fn base(&self) -> Option<&Url> {
        self.base.as_ref()
    }

    /// Expand `template` and resolve it to an absolute URL.
    ///
    /// # Errors
    /// Returns [`ClientError::UriResolution`] on a missing variable, a
    /// relative template without base URI, or an unparseable result.
    pub fn resolve(
        &self,
        template: &str,
        vars: &(impl UriVariables + ?Sized),
    ) -> Result<Url, ClientError> {
        let expanded = expand(template, vars)?;

        if let Ok(url) = Url::parse(&expanded) {
            return Ok(url);
        }

        let Some(base) = &self.base else {
            return Err(ClientError::UriResolution(format!(
                "relative URI '{expanded}' and no base URI configured"
            )));
        };

        let base = base.as_str();
        let joined = if expanded.is_empty() {
            base.to_owned()
        } else if expanded.starts_with('?') || expanded.starts_with('#') {
            format!("{}{expanded}", base.trim_end_matches('/'))
        } else {
            format!(
                "{}/{}",
                base.trim_end_matches('/'),
                expanded.trim_start_matches('/')
            )
        };

        Url::parse(&joined)
            .map_err(|e| ClientError::UriResolution(format!("invalid URI '{joined}': {e}")))
    }
}
