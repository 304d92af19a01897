use std::env;
use fuse_channel::{Callbacks, ChannelBuilder, MountFlags};
use log::error;

struct NullFS;

impl Callbacks for NullFS {}

fn main() {
    env_logger::init();
    let mountpoint = env::args_os().nth(1).expect("usage: null <mountpoint>");
    let (channel, completion) = ChannelBuilder::new("null", &mountpoint, NullFS)
        .mount_flags(MountFlags::NOSUID | MountFlags::NODEV)
        .attach()
        .unwrap();
    println!("Serving {}, unmount it to stop", channel.mountpoint().display());
    if let Err(err) = completion.wait() {
        error!("null: {}", err);
    }
    if let Err(err) = channel.detach() {
        error!("null: {}", err);
    }
}
