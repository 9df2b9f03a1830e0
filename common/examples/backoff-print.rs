// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Show the probe schedule of the default agent wait policy

use gluu_common::backoff;
use gluu_common::backoff::Backoff;

fn main() {
    let mut policy = backoff::agent_wait_policy();
    let mut total_duration = std::time::Duration::from_secs(0);
    let mut attempt = 1;
    loop {
        let nsecs = total_duration.as_secs();
        let nmillis = total_duration.as_millis() % 1000;
        print!("attempt {:2} at T={:3}.{:03}s: ", attempt, nsecs, nmillis);

        match policy.next_backoff() {
            Some(next) => {
                println!("on failure, wait {}s", next.as_secs());
                total_duration += next;
                attempt += 1;
            }
            None => {
                println!("on failure, give up");
                break;
            }
        }
    }
}
