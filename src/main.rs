use schedtools::cli;

fn main() -> anyhow::Result<()> {
    cli::run()
}
