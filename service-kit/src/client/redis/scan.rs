use redis::{Cmd, aio::ConnectionLike};

use crate::error::Error;

/// Lua wrapper around `HSCAN` that returns field names only.
pub const HSCAN_ONLY_KEYS: &str = r#"
	local results = {}
	local scan_result = redis.call('HSCAN', KEYS[1], unpack(ARGV))
	for i = 1, #scan_result[2], 2 do
		table.insert(results, scan_result[2][i])
	end
	return {scan_result[1], results}
"#;

/// Lua wrapper around `HSCAN` that returns values only.
pub const HSCAN_ONLY_VALUES: &str = r#"
	local results = {}
	local scan_result = redis.call('HSCAN', KEYS[1], unpack(ARGV))
	for i = 2, #scan_result[2], 2 do
		table.insert(results, scan_result[2][i])
	end
	return {scan_result[1], results}
"#;

/// Walks a cursor-based command (`SCAN`, `HSCAN`, `SSCAN`, ...) to the end.
///
/// `build` returns the command for a given cursor and `on_page` receives every
/// page of items. A nil reply ends the walk without error.
pub async fn paginate_scan<C, B, P>(conn: &mut C, mut build: B, mut on_page: P) -> Result<(), Error>
where
    C: ConnectionLike + Send,
    B: FnMut(u64) -> Cmd,
    P: FnMut(Vec<String>),
{
    let mut cursor = 0u64;
    loop {
        let reply: Option<(u64, Vec<String>)> = build(cursor).query_async(conn).await?;
        let Some((next, items)) = reply else {
            return Ok(());
        };
        on_page(items);
        if next == 0 {
            return Ok(());
        }
        cursor = next;
    }
}

pub async fn hscan_only_keys<C: ConnectionLike + Send>(
    conn: &mut C,
    key: &str,
    cursor: u64,
    pattern: Option<&str>,
    count: Option<u64>,
) -> Result<(u64, Vec<String>), Error> {
    Ok(hscan_script(HSCAN_ONLY_KEYS, key, cursor, pattern, count)
        .query_async(conn)
        .await?)
}

pub async fn hscan_only_values<C: ConnectionLike + Send>(
    conn: &mut C,
    key: &str,
    cursor: u64,
    pattern: Option<&str>,
    count: Option<u64>,
) -> Result<(u64, Vec<String>), Error> {
    Ok(hscan_script(HSCAN_ONLY_VALUES, key, cursor, pattern, count)
        .query_async(conn)
        .await?)
}

fn hscan_script(
    script: &str,
    key: &str,
    cursor: u64,
    pattern: Option<&str>,
    count: Option<u64>,
) -> Cmd {
    let mut cmd = redis::cmd("EVAL");
    cmd.arg(script).arg(1).arg(key).arg(cursor);
    if let Some(pattern) = pattern.filter(|p| !p.is_empty()) {
        cmd.arg("MATCH").arg(pattern);
    }
    if let Some(count) = count.filter(|c| *c > 0) {
        cmd.arg("COUNT").arg(count);
    }
    cmd
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use redis::{Pipeline, RedisFuture, Value};

    use super::*;

    #[derive(Default)]
    struct ScriptedConn {
        replies: VecDeque<Value>,
        sent: Vec<String>,
    }

    impl ScriptedConn {
        fn page(cursor: &str, items: &[&str]) -> Value {
            Value::Bulk(vec![
                Value::Data(cursor.as_bytes().to_vec()),
                Value::Bulk(
                    items
                        .iter()
                        .map(|item| Value::Data(item.as_bytes().to_vec()))
                        .collect(),
                ),
            ])
        }
    }

    impl ConnectionLike for ScriptedConn {
        fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
            self.sent
                .push(String::from_utf8_lossy(&cmd.get_packed_command()).into_owned());
            let reply = self.replies.pop_front().unwrap_or(Value::Nil);
            Box::pin(async move { Ok(reply) })
        }

        fn req_packed_commands<'a>(
            &'a mut self,
            _cmd: &'a Pipeline,
            _offset: usize,
            _count: usize,
        ) -> RedisFuture<'a, Vec<Value>> {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn get_db(&self) -> i64 {
            0
        }
    }

    #[tokio::test]
    async fn test_paginate_follows_cursor_to_zero() {
        let mut conn = ScriptedConn::default();
        conn.replies.push_back(ScriptedConn::page("17", &["a", "b"]));
        conn.replies.push_back(ScriptedConn::page("0", &["c"]));

        let mut seen = Vec::new();
        let mut cursors = Vec::new();
        paginate_scan(
            &mut conn,
            |cursor| {
                cursors.push(cursor);
                let mut cmd = redis::cmd("SCAN");
                cmd.arg(cursor);
                cmd
            },
            |page| seen.extend(page),
        )
        .await
        .unwrap();

        assert_eq!(seen, vec!["a", "b", "c"]);
        assert_eq!(cursors, vec![0, 17]);
        assert_eq!(conn.sent.len(), 2);
    }

    #[tokio::test]
    async fn test_paginate_nil_reply_ends_quietly() {
        let mut conn = ScriptedConn::default();
        let mut pages = 0;
        paginate_scan(&mut conn, |_| redis::cmd("SCAN"), |_| pages += 1)
            .await
            .unwrap();
        assert_eq!(pages, 0);
    }

    #[tokio::test]
    async fn test_hscan_only_keys_sends_script_and_options() {
        let mut conn = ScriptedConn::default();
        conn.replies.push_back(ScriptedConn::page("5", &["field1", "field2"]));

        let (cursor, keys) = hscan_only_keys(&mut conn, "pools", 0, Some("uni*"), Some(50))
            .await
            .unwrap();
        assert_eq!(cursor, 5);
        assert_eq!(keys, vec!["field1", "field2"]);

        let sent = &conn.sent[0];
        assert!(sent.contains("EVAL"));
        assert!(sent.contains("for i = 1, #scan_result[2], 2 do"));
        assert!(sent.contains("pools"));
        assert!(sent.contains("MATCH"));
        assert!(sent.contains("uni*"));
        assert!(sent.contains("COUNT"));
    }

    #[tokio::test]
    async fn test_hscan_only_values_omits_empty_options() {
        let mut conn = ScriptedConn::default();
        conn.replies.push_back(ScriptedConn::page("0", &["v1"]));

        let (cursor, values) = hscan_only_values(&mut conn, "pools", 3, Some(""), Some(0))
            .await
            .unwrap();
        assert_eq!(cursor, 0);
        assert_eq!(values, vec!["v1"]);

        let sent = &conn.sent[0];
        assert!(sent.contains("for i = 2, #scan_result[2], 2 do"));
        assert!(!sent.contains("MATCH"));
        assert!(!sent.contains("COUNT"));
    }
}
