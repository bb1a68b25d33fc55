use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "transfer-stats",
    version,
    about = "Samples account transfer counters on wall-clock boundaries and serves the series"
)]
pub struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,
    #[arg(long, default_value_t = 3000)]
    pub port: u16,
    #[arg(long, default_value_t = false)]
    pub print_openapi: bool,
}
