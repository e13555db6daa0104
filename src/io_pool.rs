/// IO 线程池
///
/// 有界的 tokio 多线程运行时，承担建连、accept 和连接握手。反应器只等待结果，
/// 不会在这些工作上阻塞。在此创建的 socket 注册在本池的 IO 驱动上，
/// 池存活期间可以被任意反应器线程轮询。

use parking_lot::Mutex;
use std::future::Future;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

use crate::error::RpcError;

pub struct IoThreadPool {
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    threads: usize,
}

impl IoThreadPool {
    pub fn new(name: &str, threads: usize) -> Result<Self, RpcError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name(format!("{}-io", name))
            .enable_all()
            .build()
            .map_err(|e| RpcError::config_error("io_threads", format!("failed to start io pool: {}", e)))?;

        tracing::debug!("io pool {}-io started with {} threads", name, threads);
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            threads,
        })
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// 在池的运行时上下文中执行同步代码（如从 std socket 转换）
    pub fn enter<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.handle.enter();
        f()
    }

    /// 停止线程池，不等待剩余任务
    ///
    /// 可以在异步上下文中调用。
    pub fn shutdown(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
            tracing::debug!("io pool stopped");
        }
    }
}

impl Drop for IoThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for IoThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoThreadPool")
            .field("threads", &self.threads)
            .field("running", &self.runtime.lock().is_some())
            .finish()
    }
}
