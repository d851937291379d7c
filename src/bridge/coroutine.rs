//! Coroutine control
//!
//! Coroutines are pinned interpreter threads. The host drives them with
//! [`resume`]; the only suspension points are script-issued yields.

use std::rc::Rc;

use mlua::{Function, Lua, MultiValue, Thread, ThreadStatus};
use tracing::debug;

use crate::error::Result;

use super::convert::Converter;
use super::registry;
use super::state::BridgeState;
use super::value::{CoroutineRef, FunctionRef, ScriptValue};

/// Observable coroutine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineStatus {
    /// Created or yielded; can be resumed
    Suspended,

    /// Currently executing (observed from a host function it called)
    Running,

    /// Returned, failed, or otherwise not resumable
    Dead,
}

/// Outcome of one resume
#[derive(Debug, PartialEq)]
pub struct ResumeResult {
    pub status: CoroutineStatus,

    /// Yielded or returned values, in script order
    pub values: Vec<ScriptValue>,

    /// Set when the resume failed
    pub error: Option<String>,
}

impl ResumeResult {
    fn dead(error: impl Into<String>) -> Self {
        ResumeResult { status: CoroutineStatus::Dead, values: Vec::new(), error: Some(error.into()) }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

pub(crate) fn create(lua: &Lua, state: &Rc<BridgeState>, function: &FunctionRef) -> Result<CoroutineRef> {
    let function: Function = lua.registry_value(function.view().key())?;
    let thread = lua.create_thread(function)?;
    let pin = registry::pin(lua, state, mlua::Value::Thread(thread))?;
    Ok(CoroutineRef::new(pin))
}

pub(crate) fn status(lua: &Lua, coroutine: &CoroutineRef) -> Result<CoroutineStatus> {
    let thread: Thread = lua.registry_value(coroutine.view().key())?;
    Ok(thread_status(lua, &thread))
}

fn thread_status(lua: &Lua, thread: &Thread) -> CoroutineStatus {
    if lua.current_thread() == *thread {
        return CoroutineStatus::Running;
    }
    match thread.status() {
        ThreadStatus::Resumable => CoroutineStatus::Suspended,
        ThreadStatus::Unresumable | ThreadStatus::Error => CoroutineStatus::Dead,
    }
}

pub(crate) fn resume(
    lua: &Lua,
    state: &Rc<BridgeState>,
    coroutine: &CoroutineRef,
    args: &[ScriptValue],
) -> Result<ResumeResult> {
    let thread: Thread = lua.registry_value(coroutine.view().key())?;
    match thread_status(lua, &thread) {
        CoroutineStatus::Suspended => {}
        CoroutineStatus::Running => {
            return Ok(ResumeResult {
                status: CoroutineStatus::Running,
                values: Vec::new(),
                error: Some("cannot resume non-suspended coroutine".to_string()),
            })
        }
        CoroutineStatus::Dead => return Ok(ResumeResult::dead("cannot resume dead coroutine")),
    }

    let converter = Converter::new(lua, state);
    let args = MultiValue::from_vec(converter.lower_all(args)?);

    debug!(coroutine = coroutine.id(), argc = args.len(), "resuming coroutine");
    match thread.resume::<_, MultiValue>(args) {
        Ok(values) => {
            let status = match thread.status() {
                ThreadStatus::Resumable => CoroutineStatus::Suspended,
                _ => CoroutineStatus::Dead,
            };
            match converter.lift_all(values) {
                Ok(values) => Ok(ResumeResult { status, values, error: None }),
                Err(err) => Ok(ResumeResult { status, values: Vec::new(), error: Some(err.to_string()) }),
            }
        }
        Err(mlua::Error::CoroutineInactive) => Ok(ResumeResult::dead("cannot resume dead coroutine")),
        Err(err) => Ok(ResumeResult::dead(crate::error::BridgeError::from(err).to_string())),
    }
}
