fn main() -> anyhow::Result<()> {
    daily_plan_lib::run()
}
