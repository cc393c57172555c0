fn main() -> anyhow::Result<()> {
    rental_settlement_lib::run()
}
