//! Integration test common infrastructure: spawn a real `bncd` process
//! against a throwaway config and drive it over a plain TCP socket.

pub mod client;
pub mod server;

pub use client::TestClient;
pub use server::TestServer;
