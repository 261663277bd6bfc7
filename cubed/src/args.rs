use clap::Parser;
use cube_common::args::{AuthorityArgs, KvArgs, ProxyArgs};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub authority: AuthorityArgs,

    #[command(flatten)]
    pub kv: KvArgs,

    #[command(flatten)]
    pub proxy: ProxyArgs,

    /// Name this process registers its worker under.
    #[arg(long, env = "NODE_NAME", default_value = "worker-1")]
    pub node_name: String,
}
