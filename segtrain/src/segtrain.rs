fn main() -> anyhow::Result<()> {
    segtrain_core::run()
}
