pub mod fork;

use tracing::{subscriber, Level};

pub fn init_test_logging() {
    subscriber::set_global_default(
        tracing_subscriber::fmt()
            .pretty()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .finish(),
    )
    .unwrap();
}

/// Runs a test in a forked copy of the test binary.
///
/// Tests that clone processes, switch namespaces, or replace well-known
/// descriptors cannot share a process with the rest of the suite; the
/// wrapped body is re-executed in a child process with a single test
/// thread and the harness only reports its exit status.
#[macro_export]
macro_rules! fork_test {
    ($(#[$meta:meta])* fn $name:ident() -> $ret:ty $body:block) => {
        $(#[$meta])*
        #[test]
        fn $name() -> ::std::process::ExitCode {
            if $crate::fork::in_host() {
                let result: $ret = (|| $body)();
                <$ret as ::std::process::Termination>::report(result)
            } else {
                $crate::fork::run(::std::module_path!(), ::std::stringify!($name))
            }
        }
    };
    ($(#[$meta:meta])* fn $name:ident() $body:block) => {
        $crate::fork_test! {
            $(#[$meta])*
            fn $name() -> () $body
        }
    };
}
