use crate::remoting::{client::*, server::*};
use crate::*;
use broker_remoting::error::ErrorKind;
use broker_remoting::*;
use rstest::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpSocket, TcpStream};

#[logfn]
#[rstest]
#[case(1)]
#[case(32)]
fn test_sync_echo(runner: TestRunner, #[case] concurrency: usize) {
    runner.block_on(async move {
        let (server, addr) = init_server(test_server_config(), None).await.expect("server");
        let client = init_client(test_client_config(), None);
        let mut calls = Vec::with_capacity(concurrency);
        for i in 0..concurrency {
            let req = Command::request(OP_ECHO, format!("ping-{}", i))
                .with_ext_field("seq", i.to_string());
            calls.push(client.invoke_sync(&addr, req, Duration::from_secs(3)));
        }
        let results = futures::future::join_all(calls).await;
        for (i, r) in results.into_iter().enumerate() {
            let resp = r.expect("echo");
            assert!(resp.is_response());
            assert!(resp.is_success());
            assert_eq!(resp.opcode, OP_ECHO);
            // responses are matched by correlation id, never by arrival order
            assert_eq!(&resp.body[..], format!("ping-{}", i).as_bytes());
            assert_eq!(resp.ext_field("seq"), Some(i.to_string().as_str()));
        }
        assert_eq!(client.engine().pending_requests(), 0);
        client.shutdown().await;
        server.shutdown().await;
    });
}

#[logfn]
#[rstest]
fn test_request_code_not_supported(runner: TestRunner) {
    runner.block_on(async move {
        let (server, addr) = init_server(test_server_config(), None).await.expect("server");
        let client = init_client(test_client_config(), None);
        let resp = client
            .invoke_sync(&addr, Command::request(99, "x"), Duration::from_secs(3))
            .await
            .expect("response");
        assert_eq!(resp.sys_code(), Some(SysResponseCode::RequestCodeNotSupported));
        assert_eq!(resp.remark.as_deref(), Some("request code 99 not supported"));
        client.shutdown().await;
        server.shutdown().await;
    });
}

#[logfn]
#[rstest]
fn test_sync_timeout(runner: TestRunner) {
    runner.block_on(async move {
        let (server, addr) = init_server(test_server_config(), None).await.expect("server");
        server.register_processor(OP_SLOW, SlowProcessor::new(Duration::from_millis(500)), None);
        let client = init_client(test_client_config(), None);
        let start = Instant::now();
        let e = client
            .invoke_sync(&addr, Command::request(OP_SLOW, "slow"), Duration::from_millis(100))
            .await
            .err()
            .expect("timeout");
        let elapsed = start.elapsed();
        info!("timeout after {:?}: {}", elapsed, e);
        assert_eq!(e, ErrorKind::Timeout);
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(450));
        assert_eq!(client.engine().pending_requests(), 0);

        // the late response is dropped, the channel keeps working
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(client.engine().pending_requests(), 0);
        let resp = client
            .invoke_sync(&addr, Command::request(OP_ECHO, "after"), Duration::from_secs(3))
            .await
            .expect("echo");
        assert_eq!(&resp.body[..], b"after");
        client.shutdown().await;
        server.shutdown().await;
    });
}

#[logfn]
#[rstest]
fn test_channel_reuse(runner: TestRunner) {
    runner.block_on(async move {
        let (server, addr) = init_server(test_server_config(), None).await.expect("server");
        let client = init_client(test_client_config(), None);
        let ch1 = client.connect(&addr).await.expect("connect");
        let ch2 = client.connect(&addr).await.expect("connect");
        assert_eq!(ch1.id(), ch2.id());

        client.close_channel(&addr).await;
        assert!(!ch1.is_active());
        let ch3 = client.connect(&addr).await.expect("reconnect");
        assert_ne!(ch1.id(), ch3.id());
        client
            .invoke_sync(&addr, Command::request(OP_ECHO, "x"), Duration::from_secs(3))
            .await
            .expect("echo");

        let e = client.connect("127.0.0.1:1").await.err().expect("refused");
        assert_eq!(e, ErrorKind::ConnectFailed);
        client.shutdown().await;
        server.shutdown().await;
    });
}

#[logfn]
#[rstest]
fn test_bind_conflict(runner: TestRunner) {
    runner.block_on(async move {
        let (server, addr) = init_server(test_server_config(), None).await.expect("server");
        let mut config = test_server_config();
        config.listen_addr = addr;
        let e = init_server(config, None).await.err().expect("address in use");
        assert_eq!(e, ErrorKind::Bind);
        server.shutdown().await;
    });
}

#[logfn]
#[rstest]
fn test_slow_dial_does_not_block_other_addrs(runner: TestRunner) {
    runner.block_on(async move {
        let (server, live_addr) = init_server(test_server_config(), None).await.expect("server");
        // a listener that never accepts, once its backlog is full further dials hang
        let socket = TcpSocket::new_v4().expect("socket");
        socket.bind("127.0.0.1:0".parse().expect("addr")).expect("bind");
        let stuck = socket.listen(1).expect("listen");
        let stuck_addr = stuck.local_addr().expect("addr").to_string();
        let mut fillers = Vec::new();
        for _ in 0..8 {
            if let Ok(Ok(s)) =
                tokio::time::timeout(Duration::from_millis(100), TcpStream::connect(&stuck_addr)).await
            {
                fillers.push(s);
            }
        }

        let mut config = test_client_config();
        config.rpc.timeout.connect_timeout = Duration::from_secs(2);
        let client = Arc::new(init_client(config, None));
        let dialing = {
            let client = client.clone();
            let stuck_addr = stuck_addr.clone();
            tokio::spawn(async move { client.connect(&stuck_addr).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let start = Instant::now();
        let resp = client
            .invoke_sync(&live_addr, Command::request(OP_ECHO, "live"), Duration::from_millis(300))
            .await
            .expect("echo");
        assert_eq!(&resp.body[..], b"live");
        assert!(start.elapsed() < Duration::from_secs(1));

        // a call to the stuck address gives up within its own timeout
        let start = Instant::now();
        let r = client
            .invoke_sync(&stuck_addr, Command::request(OP_ECHO, "stuck"), Duration::from_millis(300))
            .await;
        assert!(r.is_err());
        assert!(start.elapsed() < Duration::from_secs(1));

        dialing.abort();
        drop(fillers);
        client.shutdown().await;
        server.shutdown().await;
    });
}
