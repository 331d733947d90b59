pub mod remoting;

extern crate captains_log;
#[macro_use]
extern crate log;
pub use captains_log::logfn;

use captains_log::*;
use rstest::*;
use std::fmt;
use std::future::Future;
use tokio::runtime::Runtime;

#[fixture]
pub fn runner() -> TestRunner {
    TestRunner::new()
}

impl fmt::Debug for TestRunner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TestRunner")
    }
}

/// A multi-thread runtime per test case, logging to /tmp/remoting_test.log
pub struct TestRunner {
    rt: Runtime,
}

impl TestRunner {
    pub fn new() -> Self {
        recipe::raw_file_logger("/tmp/remoting_test.log", Level::Trace).test().build().expect("log");
        Self {
            rt: tokio::runtime::Builder::new_multi_thread()
                .worker_threads(8)
                .thread_name("remoting-test")
                .enable_all()
                .build()
                .expect("runtime"),
        }
    }

    pub fn block_on<F: Future<Output = ()> + Send + 'static>(&self, f: F) {
        self.rt.block_on(f);
    }
}
