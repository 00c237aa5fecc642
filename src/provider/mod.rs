//! 上游 LLM 调用。核心只负责选 key，真正的调用在这里、且在池锁之外进行。

mod client;
mod types;

pub use client::{ProviderClient, ProviderError};

use crate::key_pool::KeyHandle;
use futures::FutureExt;
use futures::future::BoxFuture;

/// 用所选 key 完成一次对话调用。
pub trait Completion: Send + Sync {
    fn complete<'a>(
        &'a self,
        handle: &'a KeyHandle,
        prompt: &'a str,
    ) -> BoxFuture<'a, Result<sonic_rs::Value, ProviderError>>;
}

impl Completion for ProviderClient {
    fn complete<'a>(
        &'a self,
        handle: &'a KeyHandle,
        prompt: &'a str,
    ) -> BoxFuture<'a, Result<sonic_rs::Value, ProviderError>> {
        self.chat(handle, prompt).boxed()
    }
}
