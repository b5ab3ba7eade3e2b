// Execution context - carries the backend a model is compiled against

use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use stoat_core::{Backend, BackendDevice};

/// The compile target. Compilation snapshots the context's backend, so a
/// compiled model keeps running on the backend it was built against even if
/// the context is later redirected or dropped.
pub struct Context<B: Backend> {
    backend: Arc<B>,
}

impl<B: Backend> Context<B> {
    pub fn new(backend: B) -> Self {
        Context {
            backend: Arc::new(backend),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn device(&self) -> &B::Device {
        self.backend.device()
    }

    pub(crate) fn backend_arc(&self) -> Arc<B> {
        Arc::clone(&self.backend)
    }

    /// Redirect this context to `backend` until the returned guard drops,
    /// then restore the previous backend. Guards nest.
    pub fn scoped(&mut self, backend: B) -> ContextScope<'_, B> {
        let previous = mem::replace(&mut self.backend, Arc::new(backend));
        ContextScope {
            context: self,
            previous: Some(previous),
        }
    }
}

impl<B: Backend> Clone for Context<B> {
    fn clone(&self) -> Self {
        Context {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: Backend> fmt::Debug for Context<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("device", &self.backend.device().name())
            .finish()
    }
}

/// Drop guard returned by [`Context::scoped`]; restores the context's
/// previous backend when dropped.
pub struct ContextScope<'a, B: Backend> {
    context: &'a mut Context<B>,
    previous: Option<Arc<B>>,
}

impl<B: Backend> Drop for ContextScope<'_, B> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.context.backend = previous;
        }
    }
}

impl<B: Backend> Deref for ContextScope<'_, B> {
    type Target = Context<B>;

    fn deref(&self) -> &Context<B> {
        self.context
    }
}

impl<B: Backend> DerefMut for ContextScope<'_, B> {
    fn deref_mut(&mut self) -> &mut Context<B> {
        self.context
    }
}
