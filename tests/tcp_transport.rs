//! Proxy records talking to a record server over a real TCP socket.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use mx_records::device::motor;
use mx_records::net::loopback::handle_request;
use mx_records::net::message::{Message, HEADER_LENGTH};
use mx_records::net::server::server_handle;
use mx_records::net::ServerVersion;
use mx_records::{ErrorKind, MxResult, RecordList};

fn table(text: &str) -> toml::Table {
    text.parse().unwrap()
}

fn served_list() -> Arc<RecordList> {
    let list = RecordList::new();
    list.create_record("m1", "soft_motor", &table("scale = 0.5"))
        .unwrap();
    list.finish_initialization().unwrap();
    list.open_all().unwrap();
    Arc::new(list)
}

/// Answer requests on the first accepted connection until it closes.
async fn serve(listener: TcpListener, list: Arc<RecordList>) {
    serve_with_first_delay(listener, list, Duration::ZERO).await
}

/// Like [`serve`], but hold the first reply back for `delay`.
async fn serve_with_first_delay(listener: TcpListener, list: Arc<RecordList>, delay: Duration) {
    let (mut socket, _) = listener.accept().await.unwrap();
    let mut first = true;
    loop {
        let mut header = [0u8; HEADER_LENGTH];
        if socket.read_exact(&mut header).await.is_err() {
            return;
        }
        let body = Message::body_length(&header).unwrap();
        let mut frame = vec![0u8; HEADER_LENGTH + body];
        frame[..HEADER_LENGTH].copy_from_slice(&header);
        socket.read_exact(&mut frame[HEADER_LENGTH..]).await.unwrap();
        let request = Message::decode(&frame).unwrap();
        let reply = handle_request(&list, ServerVersion::CURRENT, &request);
        if first {
            first = false;
            tokio::time::sleep(delay).await;
        }
        if socket.write_all(&reply.encode()).await.is_err() {
            return;
        }
    }
}

/// Accept one connection and read from it without ever answering.
async fn swallow(listener: TcpListener) {
    let (mut socket, _) = listener.accept().await.unwrap();
    let mut sink = vec![0u8; 4096];
    while let Ok(n) = socket.read(&mut sink).await {
        if n == 0 {
            return;
        }
    }
}

fn client_list(port: u16, timeout_ms: u64) -> RecordList {
    let list = RecordList::new();
    list.create_record(
        "srv",
        "tcp_server",
        &table(&format!(
            "hostname = \"127.0.0.1\"\nport = {}\ntimeout_ms = {}",
            port, timeout_ms
        )),
    )
    .unwrap();
    list.create_record(
        "motor1",
        "network_motor",
        &table("server = \"srv\"\nremote_record_name = \"m1\""),
    )
    .unwrap();
    list.finish_initialization().unwrap();
    list
}

/// Run blocking client code off the async runtime.
async fn on_client_thread<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    let (tx, rx) = oneshot::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn motor_proxy_moves_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let remote = served_list();
    tokio::spawn(serve(listener, Arc::clone(&remote)));

    let result: MxResult<(f64, ServerVersion)> = on_client_thread(move || {
        let list = client_list(port, 2000);
        let motor1 = list.find("motor1")?;
        motor::motor_move_absolute(&motor1, 7.5)?;
        let position = motor::motor_get_position(&motor1)?;
        let version = server_handle(&*list.find("srv")?)?.version()?;
        list.close_all()?;
        Ok((position, version))
    })
    .await;

    let (position, version) = result.unwrap();
    assert_eq!(position, 7.5);
    assert_eq!(version, ServerVersion::CURRENT);
    let m1 = remote.find("m1").unwrap();
    assert_eq!(m1.read_field("raw_position").unwrap().as_f64().unwrap(), 15.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_server_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(swallow(listener));

    let err = on_client_thread(move || {
        let list = client_list(port, 100);
        let motor1 = list.find("motor1").unwrap();
        motor::motor_get_position(&motor1).unwrap_err()
    })
    .await;

    assert_eq!(err.kind, ErrorKind::TimedOut);
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_connection_is_a_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let err = on_client_thread(move || {
        let list = client_list(port, 500);
        let motor1 = list.find("motor1").unwrap();
        motor::motor_get_position(&motor1).unwrap_err()
    })
    .await;

    assert!(err.kind.is_recoverable(), "unexpected kind {:?}", err.kind);
}

#[tokio::test(flavor = "multi_thread")]
async fn late_reply_is_discarded_and_the_connection_reused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let remote = served_list();
    tokio::spawn(serve_with_first_delay(
        listener,
        Arc::clone(&remote),
        Duration::from_millis(300),
    ));

    let result: MxResult<_> = on_client_thread(move || {
        let list = client_list(port, 100);
        list.open_all()?;
        let server = server_handle(&*list.find("srv")?)?;

        let first = server.version().unwrap_err().kind;
        let sockets_after_timeout = list.network().sockets().len();

        // Let the held-back reply arrive before asking again.
        std::thread::sleep(Duration::from_millis(400));
        let version = server.version()?;
        let position = motor::motor_get_position(&*list.find("motor1")?)?;
        let sockets_while_open = list.network().sockets().len();

        list.close_all()?;
        let sockets_after_close = list.network().sockets().len();
        Ok((
            first,
            version,
            position,
            [sockets_after_timeout, sockets_while_open, sockets_after_close],
        ))
    })
    .await;

    let (first, version, position, sockets) = result.unwrap();
    assert_eq!(first, ErrorKind::TimedOut);
    assert_eq!(version, ServerVersion::CURRENT);
    assert_eq!(position, 0.0);
    assert_eq!(sockets, [1, 1, 0]);
}
