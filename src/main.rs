fn main() -> anyhow::Result<()> {
    backup_steward_lib::run()
}
