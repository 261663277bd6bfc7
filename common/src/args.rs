use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct AuthorityArgs {
    #[arg(long, env = "AUTHORITY_IP", default_value = "127.0.0.1")]
    pub authority_ip: String,

    #[arg(long, env = "AUTHORITY_PORT", default_value_t = 8080)]
    pub authority_port: u16,

    #[arg(long, env = "HEARTBEAT_PORT", default_value_t = 8081)]
    pub heartbeat_port: u16,
}

impl AuthorityArgs {
    pub fn heartbeat_addr(&self) -> String {
        format!("{}:{}", self.authority_ip, self.heartbeat_port)
    }
}

#[derive(Parser, Debug, Clone)]
pub struct KvArgs {
    #[arg(long, env = "KV_ENDPOINT", default_value = "127.0.0.1:2379")]
    pub kv_endpoint: String,

    /// Deadline applied to every KV operation, in milliseconds.
    #[arg(long, env = "KV_TIMEOUT_MS", default_value_t = 1500)]
    pub kv_timeout_ms: u64,
}

impl KvArgs {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.kv_timeout_ms)
    }
}

#[derive(Parser, Debug, Clone)]
pub struct ProxyArgs {
    /// CIDR the authority allocates service cluster IPs from.
    #[arg(long, env = "SERVICE_CIDR", default_value = "172.16.0.0/16")]
    pub service_cidr: String,
}
