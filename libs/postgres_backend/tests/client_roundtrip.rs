/// Exercises `PostgresClient` — the receiver-side counterpart to
/// `PostgresBackend` — against a server side that writes raw `BeMessage`
/// bytes directly onto the wire, the same loopback-TCP style
/// `copy_both_roundtrip.rs` uses for the sender side.
use pq_proto::{BeMessage, RowDescriptor};
use postgres_backend::{BeMessageParsed, PostgresClient};
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
async fn send_query_writes_a_well_formed_q_message() {
    let (client_sock, mut server_sock) = make_tcp_pair().await;
    let mut client = PostgresClient::new(client_sock);

    client
        .send_query("IDENTIFY_SYSTEM")
        .await
        .expect("send query");

    let mut tag = [0u8; 1];
    server_sock.read_exact(&mut tag).await.unwrap();
    assert_eq!(tag[0], b'Q');
    let mut len_buf = [0u8; 4];
    server_sock.read_exact(&mut len_buf).await.unwrap();
    let len = i32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len - 4];
    server_sock.read_exact(&mut body).await.unwrap();
    assert_eq!(&body, b"IDENTIFY_SYSTEM\0");
}

#[tokio::test]
async fn reads_row_description_data_row_and_command_complete() {
    let (client_sock, mut server_sock) = make_tcp_pair().await;
    let mut client = PostgresClient::new(client_sock);

    let row_desc = BeMessage::RowDescription(&[
        RowDescriptor::oid_col("spcoid"),
        RowDescriptor::text_col("spclocation"),
        RowDescriptor::int8_col("size"),
    ])
    .to_bytes();
    let data_row = BeMessage::DataRow(&[None, None, Some(&b"0"[..])]).to_bytes();
    let complete = BeMessage::CommandComplete("SELECT").to_bytes();
    let copy_out = BeMessage::CopyOutResponse.to_bytes();

    server_sock.write_all(&row_desc).await.unwrap();
    server_sock.write_all(&data_row).await.unwrap();
    server_sock.write_all(&complete).await.unwrap();
    server_sock.write_all(&copy_out).await.unwrap();
    server_sock.flush().await.unwrap();

    match client.read_be_message().await.unwrap() {
        BeMessageParsed::RowDescription(cols) => {
            assert_eq!(cols.len(), 3);
            assert_eq!(cols[0].0, "spcoid");
            assert_eq!(cols[1].0, "spclocation");
            assert_eq!(cols[2].0, "size");
        }
        other => panic!("unexpected message: {other:?}"),
    }

    match client.read_be_message().await.unwrap() {
        BeMessageParsed::DataRow(cols) => {
            assert_eq!(cols.len(), 3);
            assert!(cols[0].is_none());
            assert!(cols[1].is_none());
            assert_eq!(cols[2].as_deref(), Some(&b"0"[..]));
        }
        other => panic!("unexpected message: {other:?}"),
    }

    match client.read_be_message().await.unwrap() {
        BeMessageParsed::CommandComplete(tag) => assert_eq!(tag, "SELECT"),
        other => panic!("unexpected message: {other:?}"),
    }

    match client.read_be_message().await.unwrap() {
        BeMessageParsed::CopyOutResponse => {}
        other => panic!("unexpected message: {other:?}"),
    }
}

#[tokio::test]
async fn reads_copy_data_then_copy_done() {
    let (client_sock, mut server_sock) = make_tcp_pair().await;
    let mut client = PostgresClient::new(client_sock);

    server_sock
        .write_all(&BeMessage::CopyData(b"tar bytes").to_bytes())
        .await
        .unwrap();
    server_sock
        .write_all(&BeMessage::CopyDone.to_bytes())
        .await
        .unwrap();
    server_sock.flush().await.unwrap();

    match client.read_be_message().await.unwrap() {
        BeMessageParsed::CopyData(bytes) => assert_eq!(&bytes[..], b"tar bytes"),
        other => panic!("unexpected message: {other:?}"),
    }
    match client.read_be_message().await.unwrap() {
        BeMessageParsed::CopyDone => {}
        other => panic!("unexpected message: {other:?}"),
    }
}

#[tokio::test]
async fn server_disconnect_surfaces_as_disconnected() {
    let (client_sock, server_sock) = make_tcp_pair().await;
    let mut client = PostgresClient::new(client_sock);
    drop(server_sock);

    let err = client.read_be_message().await.unwrap_err();
    assert!(matches!(err, postgres_backend::CopyStreamHandlerEnd::Disconnected));
}
