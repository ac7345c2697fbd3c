//! Process execution substrate for a concurrent, message-passing object VM.
//!
//! This crate implements the "hard part" of such a VM: a multi-threaded
//! work-stealing process scheduler, a per-process generational Immix-style
//! heap with a parallel tracing collector, a non-blocking I/O reactor, a
//! timer wheel, and the bytecode interpreter loop that ties them together.
//! The bytecode image format's compiler/toolchain, the source-language
//! standard library, and the FFI bridge are treated as external
//! collaborators; see `loader` for the minimal reader this crate owns.

pub mod block;
pub mod block_pool;
pub mod config;
pub mod error;
pub mod gc;
pub mod heap;
pub mod interpreter;
pub mod loader;
pub mod process;
pub mod reactor;
pub mod scheduler;
pub mod timer;
pub mod value;

pub use config::Config;
pub use error::VmError;

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::os::fd::IntoRawFd;
    use std::sync::Arc;

    use crate::config::Config;
    use crate::interpreter::Instruction;
    use crate::loader::{CodeBlock, Image, Module};
    use crate::scheduler::Scheduler;

    /// (S3) TCP echo: a VM process accepts a connection handed to it (via a
    /// raw fd — this crate has no `Bind`/`Accept` instruction of its own,
    /// so connection setup is the external collaborator's job, per
    /// `DESIGN.md`), reads 4 bytes and writes them back through the
    /// reactor. A plain OS thread plays the client side.
    #[test]
    fn s3_tcp_echo_through_the_reactor() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("binding the loopback listener");
        let addr = listener.local_addr().unwrap();

        let client = std::thread::spawn(move || {
            let mut stream = std::net::TcpStream::connect(addr).expect("connecting to the listener");
            stream.write_all(b"ping").expect("writing ping");
            let mut echoed = [0u8; 4];
            stream.read_exact(&mut echoed).expect("reading the echo");
            echoed
        });

        let (server_stream, _peer) = listener.accept().expect("accepting the client connection");
        server_stream.set_nonblocking(true).expect("setting the server socket non-blocking");
        let server_fd = server_stream.into_raw_fd();

        let module = Module {
            name: "echo".into(),
            source_path: "echo.src".into(),
            literals: vec![],
            body: CodeBlock {
                name: "main".into(),
                file: "echo.src".into(),
                line: 1,
                locals_count: 0,
                registers_count: 4,
                instructions: vec![
                    Instruction::LoadInt { dst: 0, value: server_fd },
                    Instruction::IoRead { dst: 1, fd: 0, max_len: 4 },
                    Instruction::IoWrite { fd: 0, data: 1 },
                    Instruction::ReturnNil,
                ],
                catch_table: vec![],
            },
        };
        let image = Arc::new(Image { modules: vec![module], entry_module: 0 });
        let scheduler = Scheduler::new(image.clone(), Arc::new(Config::default()));
        scheduler.spawn_process(Arc::new(image.modules[0].clone()), true);
        let panic = scheduler.run_to_completion();
        assert!(panic.is_none());

        let echoed = client.join().expect("client thread panicked");
        assert_eq!(&echoed, b"ping");
    }
}
