//! Solidity surface of the mixer contract.
//!
//! Everything that crosses the ABI boundary (view calls, relay calldata, log
//! decoding) goes through these bindings.

use alloy::sol;

sol! {
    interface Mixer {
        event LeafAdded(uint256 _leaf, uint256 _leafIndex);
        event DepositWithdrawn(uint256 _nullifier);

        function getRoot() external view returns (uint256);
        function getMerklePath(uint256 leafIndex) external view returns (uint256[29]);
        function makeLeafHash(uint256 secret, address withdrawTo) external pure returns (uint256);
        function makeNullifierHash(uint256 secret) external pure returns (uint256);

        function commit(uint256 leaf, address fundedBy) external payable;
        function withdraw(address withdrawTo, uint256 nullifier, uint256[8] proof) external;
    }
}
