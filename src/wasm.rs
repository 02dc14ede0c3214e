//! Browser facade
//!
//! `GuestOs` is the handle the page holds. Syscalls return a promise
//! resolving to the JSON form of `SyscallReturn`. The emulator is taken
//! out of its cell for the duration of a call, so a second call issued
//! before the first resolves sees EAGAIN instead of a borrow panic.
//!
//! Panics abort on this target, so the dispatcher's EIO mapping of handler
//! panics does not apply here; the panic hook only reports them to the
//! console.

use crate::config::EmulatorConfig;
use crate::emulator::Emulator;
use crate::kernel::{Errno, Pid, SyscallArgs, SyscallReturn};
use std::cell::RefCell;
use std::rc::Rc;
use wasm_bindgen::prelude::*;

fn init_panic_hook() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

fn to_js<T: serde::Serialize>(value: &T) -> Result<JsValue, JsValue> {
    serde_json::to_string(value)
        .map(|json| JsValue::from_str(&json))
        .map_err(|e| JsValue::from_str(&e.to_string()))
}

#[wasm_bindgen]
pub struct GuestOs {
    inner: Rc<RefCell<Option<Emulator>>>,
}

#[wasm_bindgen]
impl GuestOs {
    /// Boot from an optional JSON config
    #[wasm_bindgen(constructor)]
    pub fn new(config_json: Option<String>) -> Result<GuestOs, JsValue> {
        init_panic_hook();
        let config = match config_json {
            Some(json) => EmulatorConfig::from_json_str(&json),
            None => Ok(EmulatorConfig::default()),
        }
        .map_err(|e| JsValue::from_str(&e.to_string()))?;
        let emulator = Emulator::boot(config).map_err(|e| JsValue::from_str(&e.to_string()))?;
        web_sys::console::log_1(&"[guestos] booted".into());
        Ok(GuestOs {
            inner: Rc::new(RefCell::new(Some(emulator))),
        })
    }

    pub fn syscall(&self, pid: u32, nr: u32, args: Vec<u64>) -> js_sys::Promise {
        let inner = self.inner.clone();
        wasm_bindgen_futures::future_to_promise(async move {
            let taken = inner.borrow_mut().take();
            let Some(mut emulator) = taken else {
                return to_js(&SyscallReturn::err(Errno::EAGAIN));
            };
            let result = emulator.syscall(Pid(pid), nr, SyscallArgs::new(&args)).await;
            *inner.borrow_mut() = Some(emulator);
            to_js(&result)
        })
    }

    /// Advance emulated time; returns the current pid
    pub fn tick(&self, elapsed_ms: f64) -> Option<u32> {
        self.with(|emu| emu.tick(elapsed_ms).map(|pid| pid.0)).flatten()
    }

    pub fn current(&self) -> Option<u32> {
        self.with(|emu| emu.current().map(|pid| pid.0)).flatten()
    }

    #[wasm_bindgen(js_name = pushStdin)]
    pub fn push_stdin(&self, data: &[u8]) {
        self.with(|emu| emu.kernel_mut().push_stdin(data));
    }

    #[wasm_bindgen(js_name = takeStdout)]
    pub fn take_stdout(&self) -> Vec<u8> {
        self.with(|emu| emu.kernel_mut().take_stdout()).unwrap_or_default()
    }

    #[wasm_bindgen(js_name = takeStderr)]
    pub fn take_stderr(&self) -> Vec<u8> {
        self.with(|emu| emu.kernel_mut().take_stderr()).unwrap_or_default()
    }

    pub fn metrics(&self) -> Result<JsValue, JsValue> {
        match self.with(|emu| emu.metrics()) {
            Some(metrics) => to_js(&metrics),
            None => Err(JsValue::from_str("emulator busy")),
        }
    }

    #[wasm_bindgen(js_name = auditLog)]
    pub fn audit_log(&self) -> Result<JsValue, JsValue> {
        match self.with(|emu| emu.dispatcher().audit().to_json()) {
            Some(Ok(json)) => Ok(JsValue::from_str(&json)),
            Some(Err(e)) => Err(JsValue::from_str(&e.to_string())),
            None => Err(JsValue::from_str("emulator busy")),
        }
    }

    /// Run `f` unless a syscall currently holds the emulator
    fn with<R>(&self, f: impl FnOnce(&mut Emulator) -> R) -> Option<R> {
        self.inner.borrow_mut().as_mut().map(f)
    }
}
