//! On-chain interfaces the coordinator calls.

use alloy_sol_types::sol;

sol! {
    /// The vault holding user funds on an EVM chain.
    interface IVault {
        function withdraw(
            address token,
            uint256 amount,
            address recipient,
            uint256 nonce,
            uint256 signature,
            address nonceTaAddr,
            bytes shieldSig
        ) external;
    }

    /// The CREATE2 factory deploying user-deposit contracts.
    interface IFactory {
        function deploy(uint256 salt) external;
        event Deployed(address addr, uint256 salt);
    }

    /// A deployed user-deposit contract, swept by the vault depositor.
    interface IUserDeposit {
        function transferERC20(address token, uint256 amount) external;
    }
}
