use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, accepting TCP connections from chat clients.
    Serve(ServeArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Port to listen on, on all interfaces. Use 0 for an ephemeral port.
    pub port: u16,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Display name announced to the relay on connect.
    pub username: String,

    /// Host name or address of the relay.
    pub host: String,

    /// Port the relay listens on.
    pub port: u16,
}
