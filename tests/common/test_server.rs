use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use tempfile::TempDir;

pub const OWNER: &str = "did:plc:operator";

pub struct TestKnot {
    pub temp_dir: TempDir,
    pub base_url: String,
    pub internal_url: String,
    server_process: Option<Child>,
}

fn binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_tangled"))
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("local addr").port()
}

impl TestKnot {
    /// Initialises a knot in a fresh directory. `setup` runs against the
    /// scan root before the server starts, so repositories it creates are
    /// registered at startup.
    pub async fn start(setup: impl FnOnce(&Path)) -> Self {
        let temp_dir = TempDir::new().expect("create temp dir");
        let data_dir = temp_dir.path().join("data");
        let scan_root = temp_dir.path().join("repos");
        std::fs::create_dir_all(&scan_root).expect("create scan root");

        let init_output = Command::new(binary())
            .args(["knot", "init", "--data-dir"])
            .arg(&data_dir)
            .args(["--owner", OWNER, "--non-interactive"])
            .output()
            .expect("run init");
        assert!(init_output.status.success(), "Failed to initialize knot");

        setup(&scan_root);

        let port = free_port();
        let internal_port = free_port();
        let base_url = format!("http://127.0.0.1:{port}");
        let internal_url = format!("http://127.0.0.1:{internal_port}");

        let server_process = Command::new(binary())
            .args(["knot", "serve", "--data-dir"])
            .arg(&data_dir)
            .arg("--scan-root")
            .arg(&scan_root)
            .args(["--host", "127.0.0.1", "--port"])
            .arg(port.to_string())
            .arg("--internal-port")
            .arg(internal_port.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("start server");

        Self::wait_for_ready(&base_url).await;
        Self::wait_for_ready(&internal_url).await;

        Self {
            temp_dir,
            base_url,
            internal_url,
            server_process: Some(server_process),
        }
    }

    async fn wait_for_ready(base_url: &str) {
        let client = reqwest::Client::new();
        for _ in 0..50 {
            if client
                .get(format!("{base_url}/health"))
                .send()
                .await
                .is_ok()
            {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        panic!("Server did not become ready");
    }

    pub fn data_dir(&self) -> PathBuf {
        self.temp_dir.path().join("data")
    }

    pub fn xrpc(&self, nsid: &str) -> String {
        format!("{}/xrpc/{nsid}", self.base_url)
    }
}

impl Drop for TestKnot {
    fn drop(&mut self) {
        if let Some(mut process) = self.server_process.take() {
            let _ = process.kill();
            let _ = process.wait();
        }
    }
}

/// Creates `<scan_root>/<did>/<name>` as a git repository with one commit
/// on `main` containing a README and `src/lib.rs`.
pub fn git_repo(scan_root: &Path, did: &str, name: &str) -> PathBuf {
    let path = scan_root.join(did).join(name);
    std::fs::create_dir_all(&path).expect("create repo dir");

    let mut opts = git2::RepositoryInitOptions::new();
    opts.initial_head("main");
    let repo = git2::Repository::init_opts(&path, &opts).expect("init repo");

    std::fs::write(path.join("README.md"), "# hello\n").expect("write readme");
    std::fs::create_dir_all(path.join("src")).expect("create src");
    std::fs::write(path.join("src/lib.rs"), "pub fn answer() -> u32 { 42 }\n").expect("write lib");

    let mut index = repo.index().expect("index");
    index
        .add_all(["*"], git2::IndexAddOption::DEFAULT, None)
        .expect("add files");
    index.write().expect("write index");
    let tree_id = index.write_tree().expect("write tree");
    let tree = repo.find_tree(tree_id).expect("find tree");
    let sig = git2::Signature::now("Alice", "alice@example.com").expect("signature");
    repo.commit(Some("HEAD"), &sig, &sig, "initial commit", &tree, &[])
        .expect("commit");
    path
}
