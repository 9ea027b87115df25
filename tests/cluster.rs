//! End-to-end scenarios over a primary plus backups on loopback ports.
//!
//! Each test brings up its own in-process cluster on a disjoint port range
//! and drives it over real HTTP.

use std::time::Duration;

use replikv::{serve_http, ReplicaActor, ReplicaHandle, Role};

use serde_json::Value;

use tokio::sync::watch;
use tokio::time;

/// Spawns one replica node (actor plus HTTP front-end) on the given ports.
async fn spawn_node(
    role: Role,
    api_port: u16,
    p2p_port: u16,
    primary_p2p: Option<u16>,
    config: &str,
) -> (ReplicaHandle, watch::Sender<bool>) {
    let p2p_addr = format!("127.0.0.1:{}", p2p_port).parse().unwrap();
    let api_addr = format!("127.0.0.1:{}", api_port).parse().unwrap();
    let primary_addr =
        primary_p2p.map(|p| format!("127.0.0.1:{}", p).parse().unwrap());

    let (mut actor, handle) =
        ReplicaActor::new_and_setup(role, p2p_addr, primary_addr, Some(config))
            .await
            .unwrap();

    let (tx_term, rx_term) = watch::channel(false);
    tokio::spawn(serve_http(handle.clone(), api_addr, rx_term.clone()));
    tokio::spawn(async move {
        let _ = actor.run(rx_term).await;
    });

    (handle, tx_term)
}

struct Cluster {
    handles: Vec<ReplicaHandle>,
    _terms: Vec<watch::Sender<bool>>,
    api_ports: Vec<u16>,
}

impl Cluster {
    /// Starts a primary plus `num_backups` backups. API ports are
    /// `base..base+n`, internal ports `base+10..`.
    async fn start(base: u16, num_backups: u16, config: &str) -> Cluster {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut handles = Vec::new();
        let mut terms = Vec::new();
        let mut api_ports = Vec::new();

        let (primary, term) =
            spawn_node(Role::Primary, base, base + 10, None, config).await;
        handles.push(primary);
        terms.push(term);
        api_ports.push(base);

        for i in 1..=num_backups {
            let (backup, term) = spawn_node(
                Role::Backup,
                base + i,
                base + 10 + i,
                Some(base + 10),
                config,
            )
            .await;
            handles.push(backup);
            terms.push(term);
            api_ports.push(base + i);
        }

        // let subscriptions land before tests start issuing requests
        time::sleep(Duration::from_millis(300)).await;

        Cluster {
            handles,
            _terms: terms,
            api_ports,
        }
    }

    fn url(&self, replica: usize, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.api_ports[replica], path)
    }
}

async fn http_get(url: &str) -> (u16, Value) {
    let resp = reqwest::get(url).await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.json::<Value>().await.unwrap())
}

async fn http_post(url: &str) -> (u16, Value) {
    let resp = reqwest::Client::new().post(url).send().await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.json::<Value>().await.unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn round_trip_and_backup_convergence() {
    let cluster = Cluster::start(34000, 2, "expected_backups = 2").await;

    let (status, body) = http_post(&cluster.url(0, "/a/1")).await;
    assert_eq!(status, 200);
    assert_eq!(body["key"], "a");
    assert_eq!(body["value"], "1");

    let (status, body) = http_get(&cluster.url(0, "/a")).await;
    assert_eq!(status, 200);
    assert_eq!(body["value"], "1");

    // backups converge shortly after the commit fan-out
    time::sleep(Duration::from_millis(200)).await;
    for replica in 1..=2 {
        let (status, body) = http_get(&cluster.url(replica, "/a")).await;
        assert_eq!(status, 200);
        assert_eq!(body["value"], "1");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sequential_writes_apply_everywhere_in_order() {
    let cluster = Cluster::start(34100, 2, "expected_backups = 2").await;

    for val in ["1", "2", "3"] {
        let (status, body) =
            http_post(&cluster.url(0, &format!("/a/{}", val))).await;
        assert_eq!(status, 200);
        assert_eq!(body["value"], val);
    }

    time::sleep(Duration::from_millis(200)).await;
    for replica in 0..=2 {
        let (status, body) = http_get(&cluster.url(replica, "/a")).await;
        assert_eq!(status, 200, "replica {}", replica);
        assert_eq!(body["value"], "3", "replica {}", replica);
    }

    // three writes consumed LSNs 1..=3; the primary's quorum read of 'a'
    // above consumed 4, and backups account for its slot too
    for (replica, handle) in cluster.handles.iter().enumerate() {
        assert!(
            handle.last_applied() >= 3,
            "replica {} lastApplied {}",
            replica,
            handle.last_applied()
        );
    }
    let trace = cluster.handles[0].committed_trace();
    assert_eq!(&trace[..3], &[1, 2, 3][..]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn read_of_absent_key_reports_not_found() {
    let cluster = Cluster::start(34200, 2, "expected_backups = 2").await;

    let (status, body) = http_get(&cluster.url(0, "/missing")).await;
    assert_eq!(status, 500);
    assert_eq!(body["error"], "Key not found");

    // a backup's local read misses the same way
    let (status, body) = http_get(&cluster.url(1, "/missing")).await;
    assert_eq!(status, 500);
    assert_eq!(body["error"], "Key not found");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_to_backup_is_forbidden() {
    let cluster = Cluster::start(34300, 2, "expected_backups = 2").await;

    let (status, body) = http_post(&cluster.url(1, "/k/v")).await;
    assert_eq!(status, 403);
    assert!(body["error"].as_str().unwrap().contains("backup"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn value_may_contain_slashes() {
    let cluster = Cluster::start(34400, 2, "expected_backups = 2").await;

    let (status, body) = http_post(&cluster.url(0, "/k/a/b/c")).await;
    assert_eq!(status, 200);
    assert_eq!(body["value"], "a/b/c");

    let (status, body) = http_get(&cluster.url(0, "/k")).await;
    assert_eq!(status, 200);
    assert_eq!(body["value"], "a/b/c");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn quorum_reached_with_one_silent_backup() {
    // two backups expected, only one ever starts; quorum of 2 is still
    // reachable with the primary's self-ack plus the live backup
    let cluster = Cluster::start(34500, 1, "expected_backups = 2").await;

    let (status, body) = http_post(&cluster.url(0, "/x/v")).await;
    assert_eq!(status, 200);
    assert_eq!(body["value"], "v");

    time::sleep(Duration::from_millis(200)).await;
    let (status, body) = http_get(&cluster.url(1, "/x")).await;
    assert_eq!(status, 200);
    assert_eq!(body["value"], "v");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_requests_rejected() {
    // a lone primary with no backups commits on its self-ack
    let cluster = Cluster::start(34600, 0, "expected_backups = 0").await;

    let (status, body) = http_post(&cluster.url(0, "/k/v")).await;
    assert_eq!(status, 200);
    assert_eq!(body["value"], "v");

    // missing key
    let (status, _body) = http_get(&cluster.url(0, "/")).await;
    assert_eq!(status, 400);

    // missing value
    let (status, body) = http_post(&cluster.url(0, "/k")).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "Missing value");

    // empty value after the key segment
    let (status, _body) = http_post(&cluster.url(0, "/k/")).await;
    assert_eq!(status, 400);

    // unsupported method
    let resp = reqwest::Client::new()
        .delete(cluster.url(0, "/k"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 405);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writes_settle_on_highest_lsn() {
    let cluster = Cluster::start(34700, 2, "expected_backups = 2").await;

    let mut tasks = Vec::new();
    for val in 0..8 {
        let url = cluster.url(0, &format!("/hot/{}", val));
        tasks.push(tokio::spawn(async move { http_post(&url).await }));
    }
    for task in tasks {
        let (status, _body) = task.await.unwrap();
        assert_eq!(status, 200);
    }

    time::sleep(Duration::from_millis(300)).await;

    // whatever value won is the one with the highest LSN; every replica
    // must agree on it
    let (status, primary_body) = http_get(&cluster.url(0, "/hot")).await;
    assert_eq!(status, 200);
    for replica in 1..=2 {
        let (status, body) = http_get(&cluster.url(replica, "/hot")).await;
        assert_eq!(status, 200);
        assert_eq!(body["value"], primary_body["value"]);
    }
}
