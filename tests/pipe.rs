use std::thread;

use msgpipe::{Msg, Pipe, PipeEvents, PipeId, PipeState, flags, pipe};
use proptest::prelude::*;

const N: u64 = 100_000;

#[derive(Default)]
struct Events {
    read_activated: usize,
    write_activated: usize,
    terminated: Vec<PipeId>,
}

impl PipeEvents for Events {
    fn read_activated(&mut self, _id: PipeId) {
        self.read_activated += 1;
    }

    fn write_activated(&mut self, _id: PipeId) {
        self.write_activated += 1;
    }

    fn pipe_terminated(&mut self, id: PipeId) {
        self.terminated.push(id);
    }
}

#[test]
fn cross_thread_with_backpressure() {
    let (mut tx, mut rx) = pipe::pair().hwm(64, 64).chunk_size(16).build();

    let consumer = thread::spawn(move || {
        let mut events = Events::default();
        let mut next = 0u64;
        while next < N {
            match rx.read() {
                Some(msg) => {
                    let value = u64::from_le_bytes(msg.data().as_slice().try_into().unwrap());
                    assert_eq!(value, next);
                    next += 1;
                }
                None => {
                    rx.wait_commands_blocking().unwrap();
                    rx.process_commands(&mut events);
                }
            }
        }
        (rx, events)
    });

    let mut events = Events::default();
    let mut i = 0u64;
    while i < N {
        match tx.write(Msg::new(i.to_le_bytes().to_vec())) {
            Ok(()) => {
                i += 1;
                if i % 8 == 0 {
                    tx.flush();
                }
            }
            Err(_) => {
                tx.flush();
                // Full: wait for the reader to drain down to the low-water mark.
                while !tx.check_write() {
                    tx.wait_commands_blocking().unwrap();
                    tx.process_commands(&mut events);
                }
            }
        }
    }
    tx.flush();

    let (rx, rx_events) = consumer.join().unwrap();
    // Activations only ever follow a pipe found empty or full.
    assert!(rx_events.write_activated == 0 && events.read_activated == 0);
    assert!(rx_events.terminated.is_empty() && events.terminated.is_empty());
    drop((tx, rx));
}

#[test]
fn multipart_never_torn_across_threads() {
    let (mut tx, mut rx) = pipe::pair().hwm(0, 0).build();

    let consumer = thread::spawn(move || {
        let mut messages = 0;
        let mut parts = Vec::new();
        while messages < 1000 {
            match rx.read() {
                Some(msg) => {
                    parts.push(msg.data()[0]);
                    if !msg.more() {
                        // Frames of one message carry the same tag and arrive together.
                        assert_eq!(parts.len(), 3);
                        assert!(parts.iter().all(|&p| p == parts[0]));
                        parts.clear();
                        messages += 1;
                    }
                }
                None => {
                    assert!(parts.is_empty(), "a partial message became visible");
                    rx.wait_commands_blocking().unwrap();
                    rx.process_commands(&mut ());
                }
            }
        }
        rx
    });

    for i in 0..1000u32 {
        let tag = (i % 251) as u8;
        tx.write(Msg::with_flags(vec![tag], flags::MORE)).unwrap();
        tx.flush();
        tx.write(Msg::with_flags(vec![tag], flags::MORE)).unwrap();
        tx.flush();
        tx.write(Msg::new(vec![tag])).unwrap();
        tx.flush();
    }
    let rx = consumer.join().unwrap();
    drop((tx, rx));
}

#[derive(Debug, Clone)]
enum Op {
    Terminate { a: bool, delay: bool },
    Process { a: bool },
    ReadAll { a: bool },
    Write { a: bool, more: bool },
    Flush { a: bool },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<bool>(), any::<bool>()).prop_map(|(a, delay)| Op::Terminate { a, delay }),
        any::<bool>().prop_map(|a| Op::Process { a }),
        any::<bool>().prop_map(|a| Op::ReadAll { a }),
        (any::<bool>(), any::<bool>()).prop_map(|(a, more)| Op::Write { a, more }),
        any::<bool>().prop_map(|a| Op::Flush { a }),
    ]
}

fn side<'a>(a: bool, pa: &'a mut Pipe, pb: &'a mut Pipe) -> &'a mut Pipe {
    if a { pa } else { pb }
}

proptest! {
    /// Whatever the interleaving, both endpoints end up terminated and each
    /// reports it exactly once.
    #[test]
    fn termination_converges(
        ops in prop::collection::vec(op(), 0..40),
        delays in (any::<bool>(), any::<bool>()),
        hwm in 0usize..4,
    ) {
        let (mut pa, mut pb) = pipe::pair().hwm(hwm, hwm).delay(delays.0, delays.1).build();
        let mut ea = Events::default();
        let mut eb = Events::default();

        for op in ops {
            match op {
                Op::Terminate { a, delay } => side(a, &mut pa, &mut pb).terminate(delay),
                Op::Process { a } => {
                    if a {
                        pa.process_commands(&mut ea);
                    } else {
                        pb.process_commands(&mut eb);
                    }
                }
                Op::ReadAll { a } => {
                    let pipe = side(a, &mut pa, &mut pb);
                    while pipe.read().is_some() {}
                }
                Op::Write { a, more } => {
                    let flags = if more { flags::MORE } else { 0 };
                    let _ = side(a, &mut pa, &mut pb).write(Msg::with_flags(b"x".as_slice(), flags));
                }
                Op::Flush { a } => side(a, &mut pa, &mut pb).flush(),
            }
        }

        // Someone has to ask, at the latest now.
        pa.terminate(true);

        for _ in 0..16 {
            if pa.is_terminated() && pb.is_terminated() {
                break;
            }
            for (pipe, events) in [(&mut pa, &mut ea), (&mut pb, &mut eb)] {
                pipe.process_commands(events);
                while pipe.read().is_some() {}
            }
        }

        prop_assert_eq!(pa.state(), PipeState::Terminated);
        prop_assert_eq!(pb.state(), PipeState::Terminated);
        prop_assert_eq!(&ea.terminated, &vec![pa.id()]);
        prop_assert_eq!(&eb.terminated, &vec![pb.id()]);
    }
}
