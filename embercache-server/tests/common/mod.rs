use std::net::SocketAddr;
use std::sync::Arc;

use embercache_core::InMemoryStorage;
use embercache_server::{build_router, ServerState};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// A cache node bound to an ephemeral port for the duration of a test.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(max_memory: u64) -> Self {
        let storage = Arc::new(InMemoryStorage::new(max_memory));
        let state = Arc::new(ServerState::new("test-node", storage));
        let app = build_router(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn cache_url(&self, key: &str) -> String {
        format!("{}/cache/{}", self.base_url(), key)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.state.promises().stop();
        self.handle.abort();
    }
}
