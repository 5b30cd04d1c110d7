fn main() -> anyhow::Result<()> {
    zetcd::cli::serve::run()
}
