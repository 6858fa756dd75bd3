//! The lending protocol deployment plan.

use alloy_core::primitives::U256;
use anyhow::Result;
use plinth_deploy::{
    Arg, ContractCode, ContractDeployment, DeploymentGraph, DeploymentUnit, Invoke, PlinthConfig,
};
use serde_json::Value;

/// Roles receiving test balances of both tokens.
const HOLDERS: [&str; 3] = ["lender", "borrower1", "borrower2"];

/// Vesting schedule of the borrower's locked tokens (unix seconds).
const VESTING_START: u64 = 1_700_000_000;
const VESTING_DURATION: u64 = 86_400;

/// 0.05 and 0.15, scaled by 1e18.
const BASE_RATE_PER_YEAR: &str = "50000000000000000";
const MULTIPLIER_PER_YEAR: &str = "150000000000000000";

/// 0.5 scaled by 1e18, used for the close factor and both vault ratios.
const HALF: &str = "500000000000000000";
const LIQUIDATION_INCENTIVE: &str = "1080000000000000000";
const INITIAL_EXCHANGE_RATE: &str = "200000000000000";
const MAX_ASSETS: u64 = 10;

/// `amount` whole tokens expressed in base units of a token with `decimals` decimals.
fn units(amount: u64, decimals: u64) -> Arg {
    let scaled = U256::from(amount) * U256::from(10u64).pow(U256::from(decimals));
    Arg::value(Value::String(scaled.to_string()))
}

/// 0.0003 ETH, the price of one USDC unit in the oracle.
fn usdc_price() -> Arg {
    units(3, 14)
}

/// Register every unit of the plan, reading bytecode from the configured artifacts.
pub fn lending_plan(config: &PlinthConfig) -> Result<DeploymentGraph> {
    let code = |name: &str| ContractCode::from_artifact_file(&config.contract_artifact_path(name));

    let mut graph = DeploymentGraph::new();
    for unit in [
        token("DemoToken", code("DemoToken")?, "Demo Token", "DEMO", 18, 1_000_000_000, 100),
        token("USDCToken", code("USDCToken")?, "USD Coin", "USDC", 6, 1_000_000_000, 100_000),
        interest_rate_model(code("SimpleInterestRateModel")?),
        price_oracle(code("SimplePriceOracle")?),
        comptroller(code("Comptroller")?),
        market(code("AErc20")?),
        vesting(code("Vesting")?),
        vault(code("Vault")?),
    ] {
        graph.register(unit)?;
    }

    Ok(graph)
}

fn token(
    id: &str,
    code: ContractCode,
    name: &str,
    symbol: &str,
    decimals: u64,
    supply: u64,
    grant: u64,
) -> DeploymentUnit {
    let deployment = ContractDeployment::new(code)
        .arg(Arg::account("deployer"))
        .arg(units(supply, decimals))
        .arg(Arg::value(name))
        .arg(Arg::value(symbol))
        .deterministic();

    HOLDERS
        .into_iter()
        .fold(DeploymentUnit::new(id, deployment), |unit, holder| {
            unit.action(
                Invoke::new(id, "transfer")
                    .named(format!("transfer-{holder}"))
                    .arg(Arg::account(holder))
                    .arg(units(grant, decimals)),
            )
        })
}

fn interest_rate_model(code: ContractCode) -> DeploymentUnit {
    let deployment = ContractDeployment::new(code)
        .arg(Arg::value(BASE_RATE_PER_YEAR))
        .arg(Arg::value(MULTIPLIER_PER_YEAR));

    DeploymentUnit::new("SimpleInterestRateModel", deployment)
        .depends_on(["DemoToken"])
}

fn price_oracle(code: ContractCode) -> DeploymentUnit {
    DeploymentUnit::new("SimplePriceOracle", ContractDeployment::new(code))
        .depends_on(["DemoToken", "USDCToken"])
        .action(
            Invoke::new("SimplePriceOracle", "setDirectPrice")
                .named("price-demo")
                .arg(Arg::address_of("DemoToken"))
                .arg(units(1, 18)),
        )
        .action(
            Invoke::new("SimplePriceOracle", "setDirectPrice")
                .named("price-usdc")
                .arg(Arg::address_of("USDCToken"))
                .arg(usdc_price()),
        )
}

fn comptroller(code: ContractCode) -> DeploymentUnit {
    DeploymentUnit::new("Comptroller", ContractDeployment::new(code))
        .depends_on(["SimplePriceOracle"])
        .action(
            Invoke::new("Comptroller", "_setPriceOracle").arg(Arg::address_of("SimplePriceOracle")),
        )
        .action(Invoke::new("Comptroller", "_setMaxAssets").arg(MAX_ASSETS))
        .action(Invoke::new("Comptroller", "_setCloseFactor").arg(Arg::value(HALF)))
        .action(
            Invoke::new("Comptroller", "_setLiquidationIncentive")
                .arg(Arg::value(LIQUIDATION_INCENTIVE)),
        )
}

fn market(code: ContractCode) -> DeploymentUnit {
    let deployment = ContractDeployment::new(code)
        .arg(Arg::address_of("USDCToken"))
        .arg(Arg::address_of("Comptroller"))
        .arg(Arg::address_of("SimpleInterestRateModel"))
        .arg(Arg::value(INITIAL_EXCHANGE_RATE))
        .arg(Arg::value("Acai USDC"))
        .arg(Arg::value("aUSDC"))
        .arg(6u64)
        .deterministic();

    DeploymentUnit::new("AErc20", deployment)
        .depends_on(["SimplePriceOracle", "SimpleInterestRateModel", "Comptroller", "USDCToken"])
        .action(Invoke::new("Comptroller", "_supportMarket").arg(Arg::address_of("AErc20")))
        .action(
            Invoke::new("SimplePriceOracle", "setUnderlyingPrice")
                .arg(Arg::address_of("AErc20"))
                .arg(usdc_price()),
        )
        .action(
            Invoke::new("Comptroller", "_setCollateralFactor")
                .arg(Arg::address_of("AErc20"))
                .arg(Arg::value("0")),
        )
        .action(
            Invoke::new("USDCToken", "approve")
                .arg(Arg::address_of("AErc20"))
                .arg(units(10_000_000, 6)),
        )
        .action(Invoke::new("AErc20", "mint").arg(units(3_000_000, 6)))
}

fn vesting(code: ContractCode) -> DeploymentUnit {
    let deployment = ContractDeployment::new(code)
        .arg(Arg::account("borrower1"))
        .arg(Arg::address_of("DemoToken"))
        .arg(units(100, 18))
        .arg(VESTING_START)
        .arg(VESTING_START + VESTING_DURATION);

    DeploymentUnit::new("Vesting", deployment)
        .depends_on(["SimplePriceOracle", "Comptroller", "DemoToken", "USDCToken"])
        .action(
            Invoke::new("DemoToken", "transfer")
                .named("fund")
                .arg(Arg::address_of("Vesting"))
                .arg(units(100, 18)),
        )
        .action(Invoke::new("Vesting", "enable"))
}

fn vault(code: ContractCode) -> DeploymentUnit {
    let deployment = ContractDeployment::new(code)
        .arg(Arg::address_of("Vesting"))
        .arg(Arg::value(HALF))
        .arg(Arg::value(HALF));

    DeploymentUnit::new("Vault", deployment)
        .depends_on(["Comptroller", "Vesting"])
        .action(
            Invoke::new("Comptroller", "_supportCollateralVault")
                .arg(Arg::address_of("Vesting"))
                .arg(Arg::address_of("Vault")),
        )
}
