mod common;

use rtc_tunnel::relay;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let addr = listener.local_addr().expect("echo addr");
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

#[test_timeout::tokio_timeout_test]
async fn tcp_traffic_round_trips_through_the_tunnel() {
    let echo = echo_server().await;
    let tunnel = common::tunnel().await;

    tokio::spawn(relay::forward_streams(tunnel.server.clone(), echo.to_string()));
    let local = TcpListener::bind("127.0.0.1:0").await.expect("bind local");
    let local_addr = local.local_addr().expect("local addr");
    tokio::spawn(relay::serve_local(local, tunnel.client.clone()));

    let mut first = TcpStream::connect(local_addr).await.expect("connect first");
    let mut second = TcpStream::connect(local_addr).await.expect("connect second");

    first.write_all(b"ping one").await.expect("write first");
    second.write_all(b"ping two").await.expect("write second");

    let mut reply = [0u8; 8];
    first.read_exact(&mut reply).await.expect("read first");
    assert_eq!(&reply, b"ping one");
    second.read_exact(&mut reply).await.expect("read second");
    assert_eq!(&reply, b"ping two");
}

#[test_timeout::tokio_timeout_test]
async fn local_server_stops_when_the_tunnel_closes() {
    let tunnel = common::tunnel().await;
    let local = TcpListener::bind("127.0.0.1:0").await.expect("bind local");
    let serving = tokio::spawn(relay::serve_local(local, tunnel.client.clone()));

    tunnel.server.close().await;
    serving
        .await
        .expect("serve task")
        .expect("clean shutdown");
}
