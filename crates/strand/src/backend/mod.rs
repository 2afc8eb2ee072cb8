// Backend — the provider shim every model-level numeric call goes through
//
// Two providers implement the same contract:
//
//   Autograd ("autograd", default)   every op is recorded on the tape, so
//                                    grad, vjp and pmap are available.
//   Plain    ("plain")               plain array math with detached results.
//                                    It has no rng keys and refuses the
//                                    gradient transforms with Unsupported.
//
// SELECTION:
//
//   A BackendContext is built from a BackendConfig and names the configured
//   provider. A thread-local override stack sits on top of it: use_backend
//   pushes and returns an OverrideGuard whose Drop pops, so an override ends
//   with its scope, including on `?` returns and during unwinding. Overrides
//   nest; the innermost wins.

mod ops;
mod random;
mod transforms;

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;

use log::debug;
use serde::{Deserialize, Serialize};
use strand_core::{Error, Result};

pub use ops::{avg_pool, conv, erf, expit, logsumexp, max_pool, sum_pool, Padding};
pub use random::{get_prng, split};
pub use transforms::{
    accelerate, combine_devices, device_count, eval_on_shapes, grad, jit, pmap, psum, reshape_by_device, vjp, vmap,
};

/// An array/gradient provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Autograd,
    Plain,
}

impl Provider {
    pub fn name(&self) -> &'static str {
        match self {
            Provider::Autograd => "autograd",
            Provider::Plain => "plain",
        }
    }

    /// Look a provider up by name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "autograd" => Ok(Provider::Autograd),
            "plain" => Ok(Provider::Plain),
            other => Err(Error::UnknownBackend {
                name: other.to_string(),
            }),
        }
    }

    /// Whether gradients can be taken through this provider's results.
    pub fn supports_grad(&self) -> bool {
        matches!(self, Provider::Autograd)
    }

    pub(crate) fn unsupported(&self, op: &str) -> Error {
        Error::Unsupported {
            backend: self.name().to_string(),
            op: op.to_string(),
        }
    }

    /// Make this provider the active one until the guard drops.
    pub fn enter(self) -> OverrideGuard {
        OverrideGuard::push(self)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// Override stack

thread_local! {
    static OVERRIDES: RefCell<Vec<Provider>> = const { RefCell::new(Vec::new()) };
}

fn top_override() -> Option<Provider> {
    OVERRIDES.with(|stack| stack.borrow().last().copied())
}

/// The provider in effect on this thread: the innermost override, or
/// [`Provider::Autograd`].
pub fn current_provider() -> Provider {
    top_override().unwrap_or_default()
}

/// Keeps a provider override alive; dropping it restores the previous one.
///
/// Guards are tied to the thread that created them.
#[must_use = "the override ends as soon as the guard is dropped"]
pub struct OverrideGuard {
    provider: Provider,
    _not_send: PhantomData<*const ()>,
}

impl OverrideGuard {
    fn push(provider: Provider) -> Self {
        OVERRIDES.with(|stack| stack.borrow_mut().push(provider));
        debug!("backend override enter: {}", provider);
        OverrideGuard {
            provider,
            _not_send: PhantomData,
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }
}

impl Drop for OverrideGuard {
    fn drop(&mut self) {
        OVERRIDES.with(|stack| {
            stack.borrow_mut().pop();
        });
        debug!("backend override exit: {}", self.provider);
    }
}

/// Override the backend by name for as long as the returned guard lives.
///
/// ```ignore
/// let _guard = use_backend("plain")?;
/// assert_eq!(current_provider(), Provider::Plain);
/// ```
pub fn use_backend(name: &str) -> Result<OverrideGuard> {
    Ok(Provider::from_name(name)?.enter())
}

/// Run `f` with the named backend active.
pub fn with_backend<T>(name: &str, f: impl FnOnce() -> T) -> Result<T> {
    let _guard = use_backend(name)?;
    Ok(f())
}

// Configuration

/// Which backend a run uses, e.g. `{"backend": "plain"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub backend: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            backend: Provider::Autograd.name().to_string(),
        }
    }
}

impl BackendConfig {
    pub fn with_backend(mut self, name: impl Into<String>) -> Self {
        self.backend = name.into();
        self
    }

    /// Resolve the configured name.
    pub fn build(&self) -> Result<BackendContext> {
        Ok(BackendContext {
            configured: Provider::from_name(&self.backend)?,
        })
    }
}

/// A resolved backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendContext {
    configured: Provider,
}

impl BackendContext {
    pub fn new(configured: Provider) -> Self {
        BackendContext { configured }
    }

    pub fn configured(&self) -> Provider {
        self.configured
    }

    /// The active override if there is one, else the configured provider.
    pub fn provider(&self) -> Provider {
        top_override().unwrap_or(self.configured)
    }

    /// Make [`BackendContext::provider`] the thread's current provider for
    /// the guard's lifetime.
    pub fn enter(&self) -> OverrideGuard {
        self.provider().enter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() -> Result<()> {
        for p in [Provider::Autograd, Provider::Plain] {
            assert_eq!(Provider::from_name(p.name())?, p);
        }
        assert!(matches!(
            Provider::from_name("tensorflow"),
            Err(Error::UnknownBackend { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_overrides_nest() -> Result<()> {
        assert_eq!(current_provider(), Provider::Autograd);
        {
            let _outer = use_backend("plain")?;
            assert_eq!(current_provider(), Provider::Plain);
            {
                let _inner = use_backend("autograd")?;
                assert_eq!(current_provider(), Provider::Autograd);
            }
            assert_eq!(current_provider(), Provider::Plain);
        }
        assert_eq!(current_provider(), Provider::Autograd);
        Ok(())
    }

    #[test]
    fn test_context_prefers_override() -> Result<()> {
        let ctx = BackendConfig::default().with_backend("plain").build()?;
        assert_eq!(ctx.provider(), Provider::Plain);
        let _guard = use_backend("autograd")?;
        assert_eq!(ctx.provider(), Provider::Autograd);
        assert_eq!(ctx.configured(), Provider::Plain);
        Ok(())
    }

    #[test]
    fn test_unknown_config_fails() {
        let err = BackendConfig::default().with_backend("jax").build();
        assert!(matches!(err, Err(Error::UnknownBackend { .. })));
    }
}
