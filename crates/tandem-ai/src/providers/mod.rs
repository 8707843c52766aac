use std::sync::Once;

use crate::adapter::{clear_adapters, register_adapter, AdapterRef};

mod anthropic;
mod common;
mod openai;
mod openai_compat;

const BUILTIN_SOURCE_ID: &str = "tandem-ai-builtins";

fn register_builtin_adapter(adapter: AdapterRef) {
    register_adapter(adapter, Some(BUILTIN_SOURCE_ID.to_string()));
}

pub fn register_builtin_adapters() {
    register_builtin_adapter(anthropic::adapter());
    register_builtin_adapter(openai::adapter());
    register_builtin_adapter(openai_compat::ollama_adapter());
    register_builtin_adapter(openai_compat::openrouter_adapter());
}

pub fn reset_adapters() {
    clear_adapters();
    register_builtin_adapters();
}

pub(crate) fn ensure_builtin_adapters_registered() {
    static ONCE: Once = Once::new();
    ONCE.call_once(register_builtin_adapters);
}
