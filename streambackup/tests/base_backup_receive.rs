/// End-to-end receiver test (S1-style single regular file, §8): a simulated
/// server plays out one `BASE_BACKUP` batch — row description, primary data
/// row, command-complete, copy-out, a one-file tar stream, copy-done, then
/// a final command-complete — and the client side unpacks it exactly the
/// way `pg_basebackup`'s unpack-mode driver does.
use camino_tempfile::tempdir;
use pq_proto::{BeMessage, RowDescriptor};
use postgres_backend::{BeMessageParsed, PostgresClient};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use streambackup::unpack::{Unpacker, UnpackOptions};

async fn make_tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client_stream = TcpStream::connect(addr).await.unwrap();
    let (server_stream, _) = listener.accept().await.unwrap();
    (client_stream, server_stream)
}

fn tar_header(name: &str, size: u64) -> Vec<u8> {
    let mut header = vec![0u8; 512];
    header[0..name.len()].copy_from_slice(name.as_bytes());
    let size_str = format!("{size:011o}");
    header[124..124 + size_str.len()].copy_from_slice(size_str.as_bytes());
    header
}

#[tokio::test]
async fn unpacks_a_single_batch_base_backup() {
    let (client_sock, mut server_sock) = make_tcp_pair().await;
    let mut client = PostgresClient::new(client_sock);

    let server = tokio::spawn(async move {
        server_sock
            .write_all(
                &BeMessage::RowDescription(&[
                    RowDescriptor::oid_col("spcoid"),
                    RowDescriptor::text_col("spclocation"),
                    RowDescriptor::int8_col("size"),
                ])
                .to_bytes(),
            )
            .await
            .unwrap();
        server_sock
            .write_all(&BeMessage::DataRow(&[None, None, Some(&b"0"[..])]).to_bytes())
            .await
            .unwrap();
        server_sock
            .write_all(&BeMessage::CommandComplete("SELECT").to_bytes())
            .await
            .unwrap();
        server_sock
            .write_all(&BeMessage::CopyOutResponse.to_bytes())
            .await
            .unwrap();

        let mut tar = tar_header("x", 9);
        tar.extend_from_slice(b"abcdefghi");
        tar.extend_from_slice(&[0u8; 503]); // pad to 512
        tar.extend_from_slice(&[0u8; 1024]); // end-of-archive terminator
        server_sock
            .write_all(&BeMessage::CopyData(&tar).to_bytes())
            .await
            .unwrap();
        server_sock
            .write_all(&BeMessage::CopyDone.to_bytes())
            .await
            .unwrap();
        server_sock
            .write_all(&BeMessage::CommandComplete("BASE_BACKUP").to_bytes())
            .await
            .unwrap();
        server_sock.flush().await.unwrap();
    });

    // Mirrors pg_basebackup's unpack-mode batch loop.
    match client.read_be_message().await.unwrap() {
        BeMessageParsed::RowDescription(_) => {}
        other => panic!("unexpected: {other:?}"),
    }
    let row = match client.read_be_message().await.unwrap() {
        BeMessageParsed::DataRow(cols) => cols,
        other => panic!("unexpected: {other:?}"),
    };
    assert!(row[0].is_none(), "primary batch has a NULL location id");

    match client.read_be_message().await.unwrap() {
        BeMessageParsed::CommandComplete(_) => {}
        other => panic!("unexpected: {other:?}"),
    }
    match client.read_be_message().await.unwrap() {
        BeMessageParsed::CopyOutResponse => {}
        other => panic!("unexpected: {other:?}"),
    }

    let dir = tempdir().unwrap();
    let mut unpacker = Unpacker::new(dir.path(), UnpackOptions::default());
    loop {
        match client.read_be_message().await.unwrap() {
            BeMessageParsed::CopyData(bytes) => unpacker.feed(&bytes).await.unwrap(),
            BeMessageParsed::CopyDone => break,
            other => panic!("unexpected: {other:?}"),
        }
    }
    unpacker.finish().unwrap();

    match client.read_be_message().await.unwrap() {
        BeMessageParsed::CommandComplete(tag) => assert_eq!(tag, "BASE_BACKUP"),
        other => panic!("unexpected: {other:?}"),
    }

    let content = std::fs::read(dir.path().join("x")).unwrap();
    assert_eq!(content, b"abcdefghi");

    server.await.unwrap();
}
