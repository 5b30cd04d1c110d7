fn main() -> anyhow::Result<()> {
    zetcd::cli::ctl::run()
}
