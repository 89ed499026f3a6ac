//! Core context injection
//!
//! A process can monitor more than one core. The guard in this module sets
//! the monitored core's name and a per-session instance id for the current
//! thread, so every span opened inside the scope carries them.

use std::cell::RefCell;

use uuid::Uuid;

/// Context data stored in thread-local storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreContextData {
    /// Name of the monitored core
    pub core_name: String,
    /// Unique id for this monitoring session
    pub instance_id: Uuid,
}

thread_local! {
    static CORE_CONTEXT: RefCell<Option<CoreContextData>> = const { RefCell::new(None) };
}

/// RAII guard for core context
///
/// Sets the core context for the current thread; dropping it restores
/// whatever was active before.
///
/// ```ignore
/// use qsys_logging::CoreContextGuard;
///
/// let _guard = CoreContextGuard::new("Core-110f");
/// tracing::info!("Polling group");
/// ```
pub struct CoreContextGuard {
    previous: Option<CoreContextData>,
}

impl CoreContextGuard {
    /// Enter a context with a fresh instance id
    pub fn new(core_name: impl Into<String>) -> Self {
        Self::with_instance_id(core_name, Uuid::new_v4())
    }

    /// Enter a context with a known instance id
    pub fn with_instance_id(core_name: impl Into<String>, instance_id: Uuid) -> Self {
        let next = CoreContextData {
            core_name: core_name.into(),
            instance_id,
        };
        let previous = CORE_CONTEXT.with(|ctx| ctx.borrow_mut().replace(next));
        Self { previous }
    }

    /// The active context, if any
    pub fn current() -> Option<CoreContextData> {
        CORE_CONTEXT.with(|ctx| ctx.borrow().clone())
    }

    pub fn current_core_name() -> Option<String> {
        Self::current().map(|ctx| ctx.core_name)
    }

    pub fn current_instance_id() -> Option<Uuid> {
        Self::current().map(|ctx| ctx.instance_id)
    }
}

impl Drop for CoreContextGuard {
    fn drop(&mut self) {
        CORE_CONTEXT.with(|ctx| *ctx.borrow_mut() = self.previous.take());
    }
}

/// Run a block with a core context active
///
/// ```ignore
/// with_core_context!("Core-110f", {
///     tracing::info!("Polling group");
/// });
/// ```
#[macro_export]
macro_rules! with_core_context {
    ($core_name:expr, $body:block) => {{
        let _guard = $crate::context::CoreContextGuard::new($core_name);
        $body
    }};
}
