use crate::remoting::{client::*, server::*};
use crate::*;
use broker_remoting::error::ProcessError;
use broker_remoting::*;
use rstest::*;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;

const OP_GUARDED: i32 = 66;

#[logfn]
#[rstest]
fn test_reject_request(runner: TestRunner) {
    runner.block_on(async move {
        let (server, addr) = init_server(test_server_config(), None).await.expect("server");
        server.register_processor(OP_BUSY, BusyProcessor, None);
        let client = init_client(test_client_config(), None);
        let resp = client
            .invoke_sync(&addr, Command::request(OP_BUSY, "x"), Duration::from_secs(3))
            .await
            .expect("response");
        assert_eq!(resp.sys_code(), Some(SysResponseCode::SystemBusy));
        assert!(resp.remark.as_deref().unwrap_or_default().contains("REJECTREQUEST"));
        client.shutdown().await;
        server.shutdown().await;
    });
}

#[logfn]
#[rstest]
#[case(OP_FAIL, "disk full")]
#[case(OP_PANIC, "bad state")]
fn test_processor_failure(runner: TestRunner, #[case] opcode: i32, #[case] remark: &'static str) {
    runner.block_on(async move {
        let (server, addr) = init_server(test_server_config(), None).await.expect("server");
        server.register_processor(OP_FAIL, failing_processor(), None);
        server.register_processor(OP_PANIC, panicking_processor(), None);
        let client = init_client(test_client_config(), None);
        let resp = client
            .invoke_sync(&addr, Command::request(opcode, "x"), Duration::from_secs(3))
            .await
            .expect("response");
        assert_eq!(resp.sys_code(), Some(SysResponseCode::SystemError));
        assert!(resp.remark.as_deref().unwrap_or_default().contains(remark));
        // the dispatcher survives
        let resp = client
            .invoke_sync(&addr, Command::request(OP_ECHO, "ok"), Duration::from_secs(3))
            .await
            .expect("echo");
        assert!(resp.is_success());
        client.shutdown().await;
        server.shutdown().await;
    });
}

#[logfn]
#[rstest]
fn test_executor_overload(runner: TestRunner) {
    runner.block_on(async move {
        let (server, addr) = init_server(test_server_config(), None).await.expect("server");
        let slow = SlowProcessor::new(Duration::from_millis(500));
        let started = slow.started.clone();
        server.register_processor(OP_SLOW, slow, Some(WorkerPool::new("slow", 1)));
        let client = init_client(test_client_config(), None);
        client
            .invoke_async(&addr, Command::request(OP_SLOW, "1"), Duration::from_secs(3), |_| {})
            .await
            .expect("sent");
        assert!(wait_until(Duration::from_secs(1), || started.load(Ordering::SeqCst) == 1).await);
        let resp = client
            .invoke_sync(&addr, Command::request(OP_SLOW, "2"), Duration::from_secs(3))
            .await
            .expect("response");
        assert_eq!(resp.sys_code(), Some(SysResponseCode::SystemBusy));
        assert!(resp.remark.as_deref().unwrap_or_default().contains("OVERLOAD"));
        client.shutdown().await;
        server.shutdown().await;
    });
}

#[logfn]
#[rstest]
fn test_default_processor(runner: TestRunner) {
    runner.block_on(async move {
        let (server, addr) = init_server(test_server_config(), None).await.expect("server");
        server.register_default_processor(
            processor_fn(|req: Command| async move {
                Ok::<_, ProcessError>(Some(Command::response(0, format!("default:{}", req.opcode))))
            }),
            WorkerPool::new("default", 8),
        );
        let client = init_client(test_client_config(), None);
        let resp = client
            .invoke_sync(&addr, Command::request(77, ""), Duration::from_secs(3))
            .await
            .expect("response");
        assert_eq!(&resp.body[..], b"default:77");
        assert_eq!(resp.opcode, 77);
        // a registered opcode still wins
        let resp = client
            .invoke_sync(&addr, Command::request(OP_ECHO, "echo"), Duration::from_secs(3))
            .await
            .expect("response");
        assert_eq!(&resp.body[..], b"echo");
        client.shutdown().await;
        server.shutdown().await;
    });
}

struct AuthHook;

impl RpcHook for AuthHook {
    fn before_request(&self, _remote_addr: SocketAddr, request: &mut Command) -> Result<(), String> {
        if request.opcode == OP_GUARDED {
            return Err("no permission".to_string());
        }
        request.ext_fields.insert("hooked".to_string(), "1".to_string());
        Ok(())
    }

    fn after_response(&self, _remote_addr: SocketAddr, request: &Command, response: &mut Command) {
        response.ext_fields.insert("request_body_len".to_string(), request.body.len().to_string());
    }
}

#[logfn]
#[rstest]
fn test_rpc_hook(runner: TestRunner) {
    runner.block_on(async move {
        let (server, addr) = init_server(test_server_config(), None).await.expect("server");
        server.register_processor(OP_GUARDED, echo_processor(), None);
        server.register_rpc_hook(AuthHook);
        let client = init_client(test_client_config(), None);
        let resp = client
            .invoke_sync(&addr, Command::request(OP_ECHO, "abc"), Duration::from_secs(3))
            .await
            .expect("echo");
        assert!(resp.is_success());
        assert_eq!(resp.ext_field("hooked"), Some("1"));
        assert_eq!(resp.ext_field("request_body_len"), Some("3"));

        let resp = client
            .invoke_sync(&addr, Command::request(OP_GUARDED, "abc"), Duration::from_secs(3))
            .await
            .expect("response");
        assert_eq!(resp.sys_code(), Some(SysResponseCode::SystemError));
        assert_eq!(resp.remark.as_deref(), Some("no permission"));
        client.shutdown().await;
        server.shutdown().await;
    });
}

#[logfn]
#[rstest]
fn test_server_invokes_client(runner: TestRunner) {
    runner.block_on(async move {
        let (server, addr) = init_server(test_server_config(), None).await.expect("server");
        let client = init_client(test_client_config(), None);
        client.register_processor(OP_ECHO, echo_processor(), None);
        client.connect(&addr).await.expect("connect");
        assert!(wait_until(Duration::from_secs(1), || server.channels().len() == 1).await);
        let channel = server.channels().pop().expect("channel");
        let resp = server
            .invoke_sync(&channel, Command::request(OP_ECHO, "pushed"), Duration::from_secs(3))
            .await
            .expect("client answers");
        assert_eq!(&resp.body[..], b"pushed");
        client.shutdown().await;
        server.shutdown().await;
    });
}

#[logfn]
#[rstest]
fn test_client_default_processor(runner: TestRunner) {
    runner.block_on(async move {
        let (server, addr) = init_server(test_server_config(), None).await.expect("server");
        let client = init_client(test_client_config(), None);
        client.register_default_processor(
            processor_fn(|req: Command| async move {
                Ok::<_, ProcessError>(Some(Command::response(0, format!("client:{}", req.opcode))))
            }),
            WorkerPool::new("client_default", 8),
        );
        client.connect(&addr).await.expect("connect");
        assert!(wait_until(Duration::from_secs(1), || server.channels().len() == 1).await);
        let channel = server.channels().pop().expect("channel");
        let resp = server
            .invoke_sync(&channel, Command::request(88, ""), Duration::from_secs(3))
            .await
            .expect("client answers");
        assert_eq!(&resp.body[..], b"client:88");
        assert_eq!(resp.opcode, 88);
        client.shutdown().await;
        server.shutdown().await;
    });
}
