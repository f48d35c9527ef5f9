//! Spawns a `bncd` instance for integration testing: `bncd init` to
//! provision an owner account against a throwaway config, then `bncd
//! start` to run it.

#![allow(dead_code)]

use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::sleep;

pub struct TestServer {
    child: Child,
    port: u16,
    _dir: PathBuf,
}

impl TestServer {
    /// Provision an owner account (`owner`/`password`) and start listening
    /// on `127.0.0.1:<port>`.
    pub async fn spawn(port: u16, owner: &str, password: &str) -> anyhow::Result<Self> {
        let dir = std::env::temp_dir().join(format!("bncd-test-{port}"));
        std::fs::create_dir_all(&dir)?;

        let conf_path = dir.join("bnc.yaml");
        let storage_path = dir.join("test.redb");
        std::fs::write(
            &conf_path,
            format!(
                "bouncer:\n  listeners:\n    - \"127.0.0.1:{port}\"\n  storage:\n    type: redb\n    path: \"{storage}\"\n  status_nick: \"*status\"\n  product_host: bnc\n",
                port = port,
                storage = storage_path.display(),
            ),
        )?;

        let binary = binary_path();
        let mut init = Command::new(&binary)
            .args(["init", "--conf", conf_path.to_str().unwrap()])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()?;
        {
            let stdin = init.stdin.as_mut().expect("init has piped stdin");
            writeln!(stdin, "{owner}")?;
            writeln!(stdin, "{password}")?;
        }
        let status = init.wait()?;
        anyhow::ensure!(status.success(), "bncd init exited with {status}");

        let child = Command::new(&binary)
            .args(["start", "--conf", conf_path.to_str().unwrap()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let server = Self { child, port, _dir: dir };
        server.wait_until_ready().await?;
        Ok(server)
    }

    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    async fn wait_until_ready(&self) -> anyhow::Result<()> {
        for _ in 0..50 {
            if TcpStream::connect(self.address()).await.is_ok() {
                return Ok(());
            }
            sleep(Duration::from_millis(100)).await;
        }
        anyhow::bail!("bncd did not start listening on {}", self.address())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("target/debug/bncd")
}
