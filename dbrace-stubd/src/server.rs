//! Line-protocol connection handling.
//!
//! One task per connection, one request at a time. Store operations run on
//! the blocking pool; while one runs the connection is watched for EOF so a
//! client that goes away cancels its operation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dbrace_common::protocol::{
    CODE_BAD_REQUEST, CODE_INTERNAL, Request, Response, decode_line, encode_line,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::store::Store;

/// Accept connections until the task is dropped.
pub async fn serve(listener: TcpListener, store: Arc<Store>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("connection from {addr}");
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, store).await {
                        debug!("connection {addr} ended: {e}");
                    }
                });
            }
            Err(e) => warn!("accept error: {e}"),
        }
    }
}

pub async fn handle_connection(stream: TcpStream, store: Arc<Store>) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let response = match decode_line::<Request>(&line) {
            Ok(request) => dispatch(request, &store, &mut reader).await,
            Err(e) => Response::failure(0, CODE_BAD_REQUEST, e.to_string()),
        };
        writer.write_all(encode_line(&response)?.as_bytes()).await?;
    }
}

async fn dispatch<R>(request: Request, store: &Arc<Store>, reader: &mut R) -> Response
where
    R: AsyncBufRead + Unpin,
{
    let Request { id, op } = request;
    let name = op.name();
    let cancel = Arc::new(AtomicBool::new(false));
    let mut task = {
        let store = Arc::clone(store);
        let cancel = Arc::clone(&cancel);
        tokio::task::spawn_blocking(move || store.execute(op, &cancel))
    };

    let joined = tokio::select! {
        joined = &mut task => joined,
        closed = peer_closed(reader) => {
            if closed {
                debug!(id, op = name, "client went away; cancelling");
                cancel.store(true, Ordering::SeqCst);
            }
            task.await
        }
    };

    match joined {
        Ok(Ok(result)) => Response::success(id, result),
        Ok(Err(e)) => {
            debug!(id, op = name, code = e.code(), "{e}");
            Response::failure(id, e.code(), e.to_string())
        }
        Err(e) => Response::failure(id, CODE_INTERNAL, format!("{name} task failed: {e}")),
    }
}

/// Resolves once the peer sends EOF (true) or more data (false).
async fn peer_closed<R: AsyncBufRead + Unpin>(reader: &mut R) -> bool {
    match reader.fill_buf().await {
        Ok(buf) => buf.is_empty(),
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbrace_common::workload::{OpResult, Operation, Spin};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::Instant;

    async fn start() -> (u16, Arc<Store>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path(), None).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve(listener, Arc::clone(&store)));
        (port, store, dir)
    }

    async fn call(stream: &mut BufReader<TcpStream>, id: u64, op: Operation) -> Response {
        let line = encode_line(&Request { id, op }).unwrap();
        stream.get_mut().write_all(line.as_bytes()).await.unwrap();
        let mut reply = String::new();
        stream.read_line(&mut reply).await.unwrap();
        decode_line(&reply).unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_operations() {
        let (port, _store, _dir) = start().await;
        let mut stream = BufReader::new(TcpStream::connect(("127.0.0.1", port)).await.unwrap());

        let response = call(
            &mut stream,
            1,
            Operation::Insert {
                ns: "test.t".to_string(),
                documents: vec![json!({"a": 1}), json!({"a": 2})],
            },
        )
        .await;
        assert_eq!(response.id, 1);
        assert_eq!(response.result, Some(OpResult::Ack { n: 2 }));

        let response = call(
            &mut stream,
            2,
            Operation::Count {
                ns: "test.t".to_string(),
                filter: json!({"a": 2}),
                spin: None,
            },
        )
        .await;
        assert_eq!(response.result, Some(OpResult::Count { n: 1 }));
    }

    #[tokio::test]
    async fn test_garbage_line_gets_bad_request() {
        let (port, _store, _dir) = start().await;
        let mut stream = BufReader::new(TcpStream::connect(("127.0.0.1", port)).await.unwrap());
        stream.get_mut().write_all(b"not json\n").await.unwrap();
        let mut reply = String::new();
        stream.read_line(&mut reply).await.unwrap();
        let response: Response = decode_line(&reply).unwrap();
        assert!(!response.ok);
        assert_eq!(response.error.unwrap().code, CODE_BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_running_operation() {
        let (port, store, _dir) = start().await;
        let mut setup = BufReader::new(TcpStream::connect(("127.0.0.1", port)).await.unwrap());
        call(
            &mut setup,
            1,
            Operation::Insert {
                ns: "test.spin".to_string(),
                documents: vec![json!({})],
            },
        )
        .await;

        let mut spinner = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let line = encode_line(&Request {
            id: 1,
            op: Operation::Count {
                ns: "test.spin".to_string(),
                filter: serde_json::Value::Null,
                spin: Some(Spin::Forever),
            },
        })
        .unwrap();
        spinner.write_all(line.as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(spinner);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !store.is_idle() {
            assert!(Instant::now() < deadline, "spin was never cancelled");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Other connections keep working.
        let response = call(&mut setup, 2, Operation::Ping).await;
        assert_eq!(response.result, Some(OpResult::Pong));
    }
}
