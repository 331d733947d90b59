use crate::remoting::{client::*, server::*};
use crate::*;
use broker_remoting::error::{ErrorKind, RemotingError};
use broker_remoting::*;
use rstest::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

#[logfn]
#[rstest]
fn test_async_echo(runner: TestRunner) {
    runner.block_on(async move {
        let (server, addr) = init_server(test_server_config(), None).await.expect("server");
        let client = init_client(test_client_config(), None);
        let permits = client.engine().available_async_permits();
        let (tx, rx) = oneshot::channel();
        client
            .invoke_async(&addr, Command::request(OP_ECHO, "hello"), Duration::from_secs(3), move |r| {
                let _ = tx.send(r);
            })
            .await
            .expect("sent");
        let resp = rx.await.expect("callback").expect("echo");
        assert_eq!(&resp.body[..], b"hello");
        assert_eq!(client.engine().available_async_permits(), permits);
        assert_eq!(client.engine().pending_requests(), 0);
        client.shutdown().await;
        server.shutdown().await;
    });
}

#[logfn]
#[rstest]
fn test_async_timeout(runner: TestRunner) {
    runner.block_on(async move {
        let (server, addr) = init_server(test_server_config(), None).await.expect("server");
        server.register_processor(OP_SLOW, SlowProcessor::new(Duration::from_millis(600)), None);
        let mut config = test_client_config();
        config.rpc.async_permits = 4;
        let client = init_client(config, None);

        let called = Arc::new(AtomicUsize::new(0));
        let outcome: Arc<Mutex<Option<Result<Command, RemotingError>>>> = Arc::new(Mutex::new(None));
        let _called = called.clone();
        let _outcome = outcome.clone();
        client
            .invoke_async(&addr, Command::request(OP_SLOW, "x"), Duration::from_millis(100), move |r| {
                _called.fetch_add(1, Ordering::SeqCst);
                _outcome.lock().unwrap().replace(r);
            })
            .await
            .expect("sent");
        assert_eq!(client.engine().available_async_permits(), 3);

        // reaped well before the late response at 600ms
        assert!(wait_until(Duration::from_millis(450), || called.load(Ordering::SeqCst) == 1).await);
        let r = outcome.lock().unwrap().take().expect("outcome");
        assert_eq!(r.err().expect("timeout"), ErrorKind::Timeout);
        assert_eq!(client.engine().available_async_permits(), 4);

        // the late response finds nothing to complete
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(called.load(Ordering::SeqCst), 1);
        assert_eq!(client.engine().available_async_permits(), 4);
        assert_eq!(client.engine().pending_requests(), 0);
        client.shutdown().await;
        server.shutdown().await;
    });
}

#[logfn]
#[rstest]
fn test_async_callback_panic(runner: TestRunner) {
    runner.block_on(async move {
        let (server, addr) = init_server(test_server_config(), None).await.expect("server");
        let client = init_client(test_client_config(), None);
        client
            .invoke_async(&addr, Command::request(OP_ECHO, "a"), Duration::from_secs(3), |_r| {
                panic!("callback bug");
            })
            .await
            .expect("sent");
        tokio::time::sleep(Duration::from_millis(100)).await;
        // a panicking callback does not poison later calls
        let (tx, rx) = oneshot::channel();
        client
            .invoke_async(&addr, Command::request(OP_ECHO, "b"), Duration::from_secs(3), move |r| {
                let _ = tx.send(r);
            })
            .await
            .expect("sent");
        assert_eq!(&rx.await.expect("callback").expect("echo").body[..], b"b");
        client.shutdown().await;
        server.shutdown().await;
    });
}

#[logfn]
#[rstest]
fn test_timeout_callback_panic_isolated(runner: TestRunner) {
    runner.block_on(async move {
        let (server, addr) = init_server(test_server_config(), None).await.expect("server");
        server.register_processor(OP_SLOW, SlowProcessor::new(Duration::from_millis(600)), None);
        let mut config = test_client_config();
        config.rpc.async_permits = 4;
        let client = init_client(config, None);

        client
            .invoke_async(&addr, Command::request(OP_SLOW, "a"), Duration::from_millis(100), |_r| {
                panic!("timeout callback bug");
            })
            .await
            .expect("sent");
        let (tx, rx) = oneshot::channel();
        client
            .invoke_async(&addr, Command::request(OP_SLOW, "b"), Duration::from_millis(100), move |r| {
                let _ = tx.send(r);
            })
            .await
            .expect("sent");
        assert_eq!(client.engine().pending_requests(), 2);

        // both expire in the same sweeps, the panic does not stop the second one
        let r = tokio::time::timeout(Duration::from_millis(450), rx)
            .await
            .expect("reaped in time")
            .expect("callback");
        assert_eq!(r.err().expect("timeout"), ErrorKind::Timeout);
        assert!(wait_until(Duration::from_secs(1), || client.engine().pending_requests() == 0).await);
        assert_eq!(client.engine().available_async_permits(), 4);

        // the reaper keeps running
        assert_eq!(client.engine().scan_response_table(), 0);
        let (tx, rx) = oneshot::channel();
        client
            .invoke_async(&addr, Command::request(OP_SLOW, "c"), Duration::from_millis(100), move |r| {
                let _ = tx.send(r);
            })
            .await
            .expect("sent");
        let r = tokio::time::timeout(Duration::from_millis(450), rx)
            .await
            .expect("reaped in time")
            .expect("callback");
        assert_eq!(r.err().expect("timeout"), ErrorKind::Timeout);
        client.shutdown().await;
        server.shutdown().await;
    });
}
