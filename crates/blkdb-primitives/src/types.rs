//! Enumerations stored inside packed flag words and key bytes.

use crate::CodecError;

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident as $kind:literal {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u8)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value ),+
        }

        impl $name {
            pub fn to_u8(self) -> u8 {
                self as u8
            }
        }

        impl TryFrom<u32> for $name {
            type Error = CodecError;

            fn try_from(value: u32) -> Result<Self, Self::Error> {
                match value {
                    $( $value => Ok(Self::$variant), )+
                    _ => Err(CodecError::UnknownVariant { kind: $kind, value }),
                }
            }
        }

        impl TryFrom<u8> for $name {
            type Error = CodecError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                Self::try_from(u32::from(value))
            }
        }
    };
}

wire_enum! {
    /// How much block data the database keeps.
    DbType as "db type" {
        Bare = 0,
        Lite = 1,
        Partial = 2,
        Full = 3,
        Super = 4,
    }
}

wire_enum! {
    /// Whether spent data is pruned.
    PruneType as "prune type" {
        All = 0,
        None = 1,
    }
}

wire_enum! {
    /// Layout of the transaction bytes inside a stored tx value.
    TxSerType as "tx serialization type" {
        /// Complete raw transaction.
        Full = 0,
        /// Raw transaction with the output section excised.
        Fragged = 1,
        /// Output count only.
        CountOut = 2,
    }
}

wire_enum! {
    Spentness as "txout spentness" {
        Unspent = 0,
        Spent = 1,
        /// The database does not track spentness for this output.
        SpentUnknown = 2,
    }
}

wire_enum! {
    /// Form of the merkle data attached to a stored block header.
    MerkleSerType as "merkle serialization type" {
        NoMerkle = 0,
        PartialMerkle = 1,
        FullMerkle = 2,
    }
}

wire_enum! {
    /// Container used for an address's unspent outputs.
    ScriptUtxoType as "script utxo type" {
        Vector = 0,
        Tree = 1,
    }
}

wire_enum! {
    /// Leading byte of a unique address key.
    ScriptPrefix as "script prefix" {
        Hash160 = 0x00,
        P2sh = 0x05,
        Multisig = 0xfe,
        NonStd = 0xff,
    }
}

impl Default for DbType {
    fn default() -> Self {
        Self::Full
    }
}

impl Default for PruneType {
    fn default() -> Self {
        Self::None
    }
}

impl Default for Spentness {
    fn default() -> Self {
        Self::SpentUnknown
    }
}

impl Default for MerkleSerType {
    fn default() -> Self {
        Self::NoMerkle
    }
}

impl MerkleSerType {
    /// Merkle form that a database of type `db_type` keeps with each header.
    pub fn for_db_type(db_type: DbType) -> Self {
        match db_type {
            DbType::Bare | DbType::Full | DbType::Super => Self::NoMerkle,
            DbType::Lite => Self::PartialMerkle,
            DbType::Partial => Self::FullMerkle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_discriminant() {
        assert_eq!(DbType::try_from(3u32), Ok(DbType::Full));
        assert_eq!(
            DbType::try_from(9u32),
            Err(CodecError::UnknownVariant {
                kind: "db type",
                value: 9
            })
        );
        assert_eq!(ScriptPrefix::try_from(0xfeu8), Ok(ScriptPrefix::Multisig));
        assert!(ScriptPrefix::try_from(0x01u8).is_err());
    }

    #[test]
    fn test_merkle_type_per_db_type() {
        assert_eq!(MerkleSerType::for_db_type(DbType::Lite), MerkleSerType::PartialMerkle);
        assert_eq!(MerkleSerType::for_db_type(DbType::Partial), MerkleSerType::FullMerkle);
        assert_eq!(MerkleSerType::for_db_type(DbType::Super), MerkleSerType::NoMerkle);
    }
}
