//! Self-healing Redis client integration tests.

use service_kit::{
    RefreshState, Reloadable,
    client::{ReconnectableRedis, RedisCfg, redis::is_connection_refused},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinSet,
};

/// Minimal RESP server: answers PING with PONG and any other command with OK.
/// Dropping the future closes the listener and every accepted connection.
async fn serve_resp(listener: TcpListener) {
    let mut connections = JoinSet::new();
    while let Ok((socket, _)) = listener.accept().await {
        connections.spawn(answer_commands(socket));
    }
}

async fn answer_commands(mut socket: TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);
        while let Some((name, used)) = parse_command(&buf) {
            buf.drain(..used);
            let reply: &[u8] = if name.eq_ignore_ascii_case("PING") {
                b"+PONG\r\n"
            } else {
                b"+OK\r\n"
            };
            if socket.write_all(reply).await.is_err() {
                return;
            }
        }
    }
}

/// Name of the first complete command in `buf` and the bytes it spans.
fn parse_command(buf: &[u8]) -> Option<(String, usize)> {
    let mut pos = 0;
    let count: usize = read_line(buf, &mut pos)?.strip_prefix('*')?.parse().ok()?;
    let mut name = String::new();
    for i in 0..count {
        let len: usize = read_line(buf, &mut pos)?.strip_prefix('$')?.parse().ok()?;
        let end = pos + len;
        if buf.len() < end + 2 {
            return None;
        }
        if i == 0 {
            name = String::from_utf8_lossy(&buf[pos..end]).into_owned();
        }
        pos = end + 2;
    }
    Some((name, pos))
}

fn read_line<'a>(buf: &'a [u8], pos: &mut usize) -> Option<&'a str> {
    let rest = &buf[*pos..];
    let end = rest.windows(2).position(|w| w == b"\r\n")?;
    let line = std::str::from_utf8(&rest[..end]).ok()?;
    *pos += end + 2;
    Some(line)
}

async fn ping(client: &mut ReconnectableRedis) -> redis::RedisResult<String> {
    redis::cmd("PING").query_async(client).await
}

fn refused_cfg() -> RedisCfg {
    // Nothing listens on port 1, so every dial is refused.
    let mut cfg = RedisCfg::new("redis://127.0.0.1:1/0");
    cfg.refresh_cooldown_ms = 0;
    cfg.connection_timeout_ms = 1_000;
    RedisCfg::on_update(None, &mut cfg);
    cfg
}

#[tokio::test]
async fn refused_connection_triggers_refresh() {
    let cfg = refused_cfg();
    let mut client = cfg.client().expect("client is built lazily").clone();
    let before = client.current();

    let res: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut client).await;
    let err = res.expect_err("nothing is listening");
    assert!(is_connection_refused(&err));

    assert_eq!(client.generation(), 1);
    assert!(!std::sync::Arc::ptr_eq(&before, &client.current()));

    // Zero cooldown: the next failure refreshes again.
    let res: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut client).await;
    assert!(res.is_err());
    assert_eq!(client.generation(), 2);
    assert_eq!(client.state(), RefreshState::Healthy);
}

#[tokio::test]
async fn cooldown_limits_refreshes_during_outage() {
    let mut cfg = RedisCfg::new("redis://127.0.0.1:1/0");
    cfg.refresh_cooldown_ms = 60_000;
    RedisCfg::on_update(None, &mut cfg);
    let client = cfg.client().expect("client is built lazily").clone();

    let mut handles = Vec::new();
    for _ in 0..20 {
        let mut client = client.clone();
        handles.push(tokio::spawn(async move {
            let res: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut client).await;
            res.is_err()
        }));
    }
    for handle in handles {
        assert!(handle.await.expect("task panicked"));
    }

    assert_eq!(client.generation(), 1);
    assert_eq!(client.state(), RefreshState::Cooldown);
}

#[tokio::test]
async fn client_recovers_after_server_restart() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(serve_resp(listener));

    let mut cfg = RedisCfg::new(format!("redis://{addr}/0"));
    cfg.refresh_cooldown_ms = 0;
    cfg.connection_timeout_ms = 1_000;
    cfg.response_timeout_ms = 1_000;
    RedisCfg::on_update(None, &mut cfg);
    let mut client = cfg.client().expect("client is built lazily").clone();

    assert_eq!(ping(&mut client).await.expect("server is up"), "PONG");
    assert_eq!(client.generation(), 0);
    assert!(client.current().is_connected());

    server.abort();
    let _ = server.await;

    // The established connection is gone; the first failure replaces it.
    for _ in 0..3 {
        assert!(ping(&mut client).await.is_err());
    }
    assert!(client.generation() >= 1);

    let listener = TcpListener::bind(addr).await.expect("port is free again");
    let _server = tokio::spawn(serve_resp(listener));

    for _ in 0..3 {
        assert_eq!(ping(&mut client).await.expect("client heals"), "PONG");
    }
}

#[tokio::test]
#[ignore] // Requires Redis at REDIS_URL
async fn commands_flow_through_wrapper() {
    use redis::AsyncCommands;

    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".into());
    let mut cfg = RedisCfg::new(url);
    RedisCfg::on_update(None, &mut cfg);
    let mut client = cfg.client().expect("client is built lazily").clone();

    let _: () = client.set("service-kit:test", "value").await.expect("SET failed");
    let value: String = client.get("service-kit:test").await.expect("GET failed");
    assert_eq!(value, "value");

    let mut seen = Vec::new();
    service_kit::client::redis::paginate_scan(
        &mut client,
        |cursor| {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor).arg("MATCH").arg("service-kit:*");
            cmd
        },
        |page| seen.extend(page),
    )
    .await
    .expect("SCAN failed");
    assert!(seen.iter().any(|key| key == "service-kit:test"));
    assert_eq!(client.generation(), 0);
}
