// Part of ecrt. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Drive a domain through a few cycles over the loopback transport.
//! Without slaves on the ring every working counter stays zero, which
//! the domain state faithfully reports.

use std::{thread, time::Duration};

use ecrt::{Datagram, Loopback, Master, WcState};

fn main() -> ecrt::Result<()> {
    env_logger::init();

    let mut master = Master::new(Box::new(Loopback::default()));
    let idx = master.create_domain()?;
    let mut domain = master.domain(idx);
    domain.append(Datagram::bwr("outputs", 0x0F00, 4)?)?;
    domain.append(Datagram::brd("inputs", 0x1000, 2)?)?;
    master.activate()?;

    // initial output values, written straight into the wire payload
    master.domain_data(idx)?[0..4].copy_from_slice(&[1, 2, 3, 4]);

    for cycle in 0..10u32 {
        master.receive()?;
        let state = master.domain(idx).process()?;
        match state.wc_state {
            WcState::Complete => {
                let data = master.domain_data(idx)?;
                println!("cycle {}: inputs {:?}", cycle, &data[4..6]);
            }
            _ => println!("cycle {}: domain state {:?}", cycle, state),
        }

        master.domain(idx).queue()?;
        master.send()?;
        thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}
