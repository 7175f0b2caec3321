//! Lazily resolved user operation fields.
//!
//! Every field whose value needs a network round trip (nonce, init code,
//! factory data, gas numbers) is carried as a [`DeferredValue`] until a stage
//! or the final resolution pass needs the concrete value.

use crate::error::{AccountError, Result};
use futures::future::{self, BoxFuture, FutureExt};
use std::{fmt, future::Future};

pub enum DeferredValue<T> {
    Resolved(T),
    Pending(BoxFuture<'static, Result<T>>),
}

impl<T> DeferredValue<T>
where
    T: Clone + Send + 'static,
{
    pub fn pending<F>(fut: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self::Pending(fut.boxed())
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    pub fn as_resolved(&self) -> Option<&T> {
        match self {
            Self::Resolved(value) => Some(value),
            Self::Pending(_) => None,
        }
    }

    /// Resolves the value and caches the outcome in place.
    ///
    /// A second call never re-runs the computation: a success is returned from
    /// the cache, a failure is replayed from the cached error.
    pub async fn resolve(&mut self) -> Result<T> {
        let outcome = match self {
            Self::Resolved(value) => return Ok(value.clone()),
            Self::Pending(pending) => pending.await,
        };

        match outcome {
            Ok(value) => {
                *self = Self::Resolved(value.clone());
                Ok(value)
            }
            Err(err) => {
                *self = Self::failed(err.clone());
                Err(err)
            }
        }
    }

    pub async fn into_value(mut self) -> Result<T> {
        self.resolve().await
    }

    /// Applies `f` once the value is known, without forcing resolution now.
    pub fn map<U, F>(self, f: F) -> DeferredValue<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        match self {
            Self::Resolved(value) => DeferredValue::Resolved(f(value)),
            Self::Pending(pending) => DeferredValue::pending(pending.map(|res| res.map(f))),
        }
    }

    fn failed(err: AccountError) -> Self {
        Self::Pending(future::ready(Err(err)).boxed())
    }
}

/// `Some(value)` when `condition` resolves to true, `None` otherwise; `value` is
/// only resolved when it is needed.
pub fn conditional<T>(condition: DeferredValue<bool>, value: DeferredValue<T>) -> DeferredValue<Option<T>>
where
    T: Clone + Send + 'static,
{
    DeferredValue::pending(async move {
        if condition.into_value().await? {
            Ok(Some(value.into_value().await?))
        } else {
            Ok(None)
        }
    })
}

impl<T> From<T> for DeferredValue<T> {
    fn from(value: T) -> Self {
        Self::Resolved(value)
    }
}

impl<T: fmt::Debug> fmt::Debug for DeferredValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolved(value) => f.debug_tuple("Resolved").field(value).finish(),
            Self::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}
