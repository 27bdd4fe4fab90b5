//! Process-level entry point.
//!
//! A `Binding` owns the engine, the shutdown coordinator shared by every
//! context it creates, and the lazily created default context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::{BindingConfig, ContextOptions};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::native::NativeEngine;
use crate::shutdown::ShutdownCoordinator;

struct BindingInner {
    engine: Arc<dyn NativeEngine>,
    shutdown: Arc<ShutdownCoordinator>,
    config: BindingConfig,
    default_context: Mutex<Option<Context>>,
}

#[derive(Clone)]
pub struct Binding {
    inner: Arc<BindingInner>,
}

lazy_static::lazy_static! {
    static ref EXIT_HOOK: Mutex<Option<Weak<BindingInner>>> = Mutex::new(None);
}

static EXIT_HOOK_REGISTERED: AtomicBool = AtomicBool::new(false);

extern "C" fn run_exit_hook() {
    let binding = EXIT_HOOK.lock().take().and_then(|weak| weak.upgrade());
    if let Some(inner) = binding {
        Binding { inner }.exit();
    }
}

impl Binding {
    pub fn init(engine: Arc<dyn NativeEngine>, config: BindingConfig) -> Result<Binding> {
        config.validate()?;
        info!(
            "Binding initialized (encoding: {:?}, per_db: {})",
            config.context.encoding, config.context.per_db
        );
        Ok(Binding {
            inner: Arc::new(BindingInner {
                engine,
                shutdown: ShutdownCoordinator::new(),
                config,
                default_context: Mutex::new(None),
            }),
        })
    }

    pub fn engine(&self) -> &Arc<dyn NativeEngine> {
        &self.inner.engine
    }

    pub fn config(&self) -> &BindingConfig {
        &self.inner.config
    }

    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.inner.shutdown
    }

    pub fn is_exited(&self) -> bool {
        self.inner.shutdown.is_exited()
    }

    /// New context; `None` uses the configured defaults.
    pub fn new_context(&self, options: Option<ContextOptions>) -> Result<Context> {
        let options = options.unwrap_or_else(|| self.inner.config.context.clone());
        Context::new(
            Arc::clone(&self.inner.engine),
            Arc::clone(&self.inner.shutdown),
            options,
        )
    }

    /// The process-wide default context, created on first use and recreated
    /// if it has been closed.
    pub fn default_context(&self) -> Result<Context> {
        let mut default_context = self.inner.default_context.lock();
        if let Some(context) = default_context.as_ref() {
            if !context.is_closed() {
                return Ok(context.clone());
            }
        }
        let context = self.new_context(None)?;
        *default_context = Some(context.clone());
        Ok(context)
    }

    /// `context` itself, or the default context when none is given.
    pub fn ensure_context(&self, context: Option<&Context>) -> Result<Context> {
        match context {
            Some(context) => Ok(context.clone()),
            None => self.default_context(),
        }
    }

    /// Process teardown: the engine finalizes everything it still owns, then
    /// the exited flag is raised and every live context is closed locally.
    /// No native call is made after the flag is raised.
    pub fn exit(&self) {
        if self.inner.shutdown.is_exited() {
            return;
        }
        self.inner.engine.fin();
        if !self.inner.shutdown.mark_exited() {
            return;
        }

        let contexts = self.inner.shutdown.live_contexts();
        let count = contexts.len();
        for context in contexts {
            context.close();
        }
        self.inner.default_context.lock().take();
        info!("Binding exited ({} live contexts released)", count);
    }

    /// Runs `exit` from the C runtime's `atexit` chain. Only the most
    /// recently installed binding is torn down.
    pub fn install_exit_hook(&self) -> Result<()> {
        *EXIT_HOOK.lock() = Some(Arc::downgrade(&self.inner));
        if EXIT_HOOK_REGISTERED.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let rc = unsafe { libc::atexit(run_exit_hook) };
        if rc != 0 {
            EXIT_HOOK_REGISTERED.store(false, Ordering::Release);
            return Err(Error::ConfigError("atexit registration failed".to_string()));
        }
        debug!("Exit hook installed");
        Ok(())
    }
}
