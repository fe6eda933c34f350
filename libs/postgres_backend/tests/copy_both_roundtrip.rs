/// Exercises `PostgresBackend` the way C4's WAL streamer uses it: switch
/// into `COPY BOTH`, write a tagged message, split into independent
/// read/write halves, and read a frontend standby status update back.
use pq_proto::{BeMessage, FeMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn make_tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client_stream = TcpStream::connect(addr).await.unwrap();
    let (server_stream, _) = listener.accept().await.unwrap();
    (client_stream, server_stream)
}

#[tokio::test]
async fn copy_both_response_is_well_formed() {
    let (mut client_sock, server_sock) = make_tcp_pair().await;

    let mut pgb = postgres_backend::PostgresBackend::new(server_sock);
    pgb.start_copy_both().await.expect("start copy both");

    let mut tag = [0u8; 1];
    client_sock.read_exact(&mut tag).await.unwrap();
    assert_eq!(tag[0], b'W');
    let mut len_buf = [0u8; 4];
    client_sock.read_exact(&mut len_buf).await.unwrap();
    let len = i32::from_be_bytes(len_buf) as usize;
    let mut rest = vec![0u8; len - 4];
    client_sock.read_exact(&mut rest).await.unwrap();
}

#[tokio::test]
async fn reads_standby_status_update() {
    let (mut client_sock, server_sock) = make_tcp_pair().await;
    let mut pgb = postgres_backend::PostgresBackend::new(server_sock);

    // Frontend sends a raw 'r' standby status update.
    let mut payload = Vec::new();
    payload.extend_from_slice(&100u64.to_be_bytes());
    payload.extend_from_slice(&100u64.to_be_bytes());
    payload.extend_from_slice(&100u64.to_be_bytes());
    payload.extend_from_slice(&0i64.to_be_bytes());
    payload.push(0);

    client_sock.write_u8(b'r').await.unwrap();
    client_sock
        .write_i32((payload.len() + 4) as i32)
        .await
        .unwrap();
    client_sock.write_all(&payload).await.unwrap();
    client_sock.flush().await.unwrap();

    match pgb.read_copy_message().await.expect("read message") {
        FeMessage::StandbyStatusUpdate { write_lsn, .. } => {
            assert_eq!(u64::from(write_lsn), 100);
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

#[tokio::test]
async fn xlog_data_carries_payload_through_copy_data() {
    let (mut client_sock, server_sock) = make_tcp_pair().await;
    let mut pgb = postgres_backend::PostgresBackend::new(server_sock);

    pgb.write_message(&BeMessage::CopyData(b"hello wal"))
        .await
        .expect("write copy data");

    let mut tag = [0u8; 1];
    client_sock.read_exact(&mut tag).await.unwrap();
    assert_eq!(tag[0], b'd');
    let mut len_buf = [0u8; 4];
    client_sock.read_exact(&mut len_buf).await.unwrap();
    let len = i32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len - 4];
    client_sock.read_exact(&mut body).await.unwrap();
    assert_eq!(body, b"hello wal");
}
