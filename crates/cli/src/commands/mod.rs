// CLI subcommand dispatch.

use clap::Subcommand;

pub mod send;
pub mod watch;

#[derive(Subcommand)]
pub enum Command {
    /// Stream a case's documents and chat; stdin lines are sent as messages
    Watch(watch::WatchArgs),
    /// Ask one question and print the reply
    Send(send::SendArgs),
}

pub fn run(cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Watch(args) => watch::run(args),
        Command::Send(args) => send::run(args),
    }
}
