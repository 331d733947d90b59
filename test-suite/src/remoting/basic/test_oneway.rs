use crate::remoting::{client::*, server::*};
use crate::*;
use broker_remoting::error::ProcessError;
use broker_remoting::*;
use rstest::*;
use std::time::Duration;
use tokio::sync::mpsc;

const OP_NOTIFY: i32 = 40;

#[logfn]
#[rstest]
#[case(1)]
#[case(100)]
fn test_oneway(runner: TestRunner, #[case] count: usize) {
    runner.block_on(async move {
        let (server, addr) = init_server(test_server_config(), None).await.expect("server");
        let (tx, mut rx) = mpsc::unbounded_channel::<(bool, String)>();
        server.register_processor(
            OP_NOTIFY,
            processor_fn(move |req: Command| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((req.is_oneway(), String::from_utf8_lossy(&req.body).to_string()));
                    // ignored for one-way requests
                    Ok::<_, ProcessError>(Some(Command::response(0, "ack")))
                }
            }),
            None,
        );
        let mut config = test_client_config();
        config.rpc.oneway_permits = 16;
        config.rpc.permit_wait = Duration::from_secs(1);
        let client = init_client(config, None);
        for i in 0..count {
            client
                .invoke_oneway(&addr, Command::request(OP_NOTIFY, format!("n{}", i)), Duration::from_secs(3))
                .await
                .expect("sent");
        }
        let mut got = Vec::new();
        for _ in 0..count {
            let (oneway, body) =
                tokio::time::timeout(Duration::from_secs(3), rx.recv()).await.expect("delivered").expect("open");
            assert!(oneway);
            got.push(body);
        }
        got.sort();
        let mut expected: Vec<String> = (0..count).map(|i| format!("n{}", i)).collect();
        expected.sort();
        assert_eq!(got, expected);

        // permits come back once written, nothing waits for a response
        assert!(
            wait_until(Duration::from_secs(1), || client.engine().available_oneway_permits() == 16)
                .await
        );
        assert_eq!(client.engine().pending_requests(), 0);
        client.shutdown().await;
        server.shutdown().await;
    });
}

#[logfn]
#[rstest]
fn test_oneway_unknown_opcode_is_silent(runner: TestRunner) {
    runner.block_on(async move {
        let (server, addr) = init_server(test_server_config(), None).await.expect("server");
        let client = init_client(test_client_config(), None);
        client
            .invoke_oneway(&addr, Command::oneway(99, "x"), Duration::from_secs(1))
            .await
            .expect("sent");
        // no response comes back for a one-way request, the channel keeps serving
        let resp = client
            .invoke_sync(&addr, Command::request(OP_ECHO, "y"), Duration::from_secs(3))
            .await
            .expect("echo");
        assert_eq!(&resp.body[..], b"y");
        client.shutdown().await;
        server.shutdown().await;
    });
}
