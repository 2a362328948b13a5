//! Block id vocabulary.
//!
//! Ids are dense from 0, so a block id is valid exactly when it indexes
//! [`Block::ALL`].

use serde::{Deserialize, Serialize};

/// Raw block id as stored in a grid and sent on the wire.
pub type BlockId = u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Block {
    Air = 0,
    Stone = 1,
    Grass = 2,
    Dirt = 3,
    Cobblestone = 4,
    Planks = 5,
    Sapling = 6,
    Bedrock = 7,
    FlowingWater = 8,
    StillWater = 9,
    FlowingLava = 10,
    StillLava = 11,
    Sand = 12,
    Gravel = 13,
    GoldOre = 14,
    IronOre = 15,
    CoalOre = 16,
    Log = 17,
    Leaves = 18,
    Sponge = 19,
    Glass = 20,
    RedCloth = 21,
    OrangeCloth = 22,
    YellowCloth = 23,
    LimeCloth = 24,
    GreenCloth = 25,
    TealCloth = 26,
    AquaCloth = 27,
    CyanCloth = 28,
    BlueCloth = 29,
    IndigoCloth = 30,
    VioletCloth = 31,
    MagentaCloth = 32,
    PinkCloth = 33,
    BlackCloth = 34,
    GrayCloth = 35,
    WhiteCloth = 36,
    Dandelion = 37,
    Rose = 38,
    BrownMushroom = 39,
    RedMushroom = 40,
    Gold = 41,
    Iron = 42,
    DoubleSlab = 43,
    Slab = 44,
    Bricks = 45,
    Tnt = 46,
    Bookshelf = 47,
    MossyCobblestone = 48,
    Obsidian = 49,
    CobblestoneSlab = 50,
    Rope = 51,
    Sandstone = 52,
    Snow = 53,
    Fire = 54,
    LightPinkCloth = 55,
    ForestGreenCloth = 56,
    BrownCloth = 57,
    DeepBlueCloth = 58,
    TurquoiseCloth = 59,
    Ice = 60,
    CeramicTile = 61,
    Magma = 62,
    Pillar = 63,
    Crate = 64,
    StoneBrick = 65,
}

impl Block {
    /// Every block, indexed by id.
    pub const ALL: [Block; 66] = [
        Block::Air,
        Block::Stone,
        Block::Grass,
        Block::Dirt,
        Block::Cobblestone,
        Block::Planks,
        Block::Sapling,
        Block::Bedrock,
        Block::FlowingWater,
        Block::StillWater,
        Block::FlowingLava,
        Block::StillLava,
        Block::Sand,
        Block::Gravel,
        Block::GoldOre,
        Block::IronOre,
        Block::CoalOre,
        Block::Log,
        Block::Leaves,
        Block::Sponge,
        Block::Glass,
        Block::RedCloth,
        Block::OrangeCloth,
        Block::YellowCloth,
        Block::LimeCloth,
        Block::GreenCloth,
        Block::TealCloth,
        Block::AquaCloth,
        Block::CyanCloth,
        Block::BlueCloth,
        Block::IndigoCloth,
        Block::VioletCloth,
        Block::MagentaCloth,
        Block::PinkCloth,
        Block::BlackCloth,
        Block::GrayCloth,
        Block::WhiteCloth,
        Block::Dandelion,
        Block::Rose,
        Block::BrownMushroom,
        Block::RedMushroom,
        Block::Gold,
        Block::Iron,
        Block::DoubleSlab,
        Block::Slab,
        Block::Bricks,
        Block::Tnt,
        Block::Bookshelf,
        Block::MossyCobblestone,
        Block::Obsidian,
        Block::CobblestoneSlab,
        Block::Rope,
        Block::Sandstone,
        Block::Snow,
        Block::Fire,
        Block::LightPinkCloth,
        Block::ForestGreenCloth,
        Block::BrownCloth,
        Block::DeepBlueCloth,
        Block::TurquoiseCloth,
        Block::Ice,
        Block::CeramicTile,
        Block::Magma,
        Block::Pillar,
        Block::Crate,
        Block::StoneBrick,
    ];

    pub fn from_u8(id: BlockId) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    pub fn id(self) -> BlockId {
        self as BlockId
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_matches_discriminants() {
        for (index, block) in Block::ALL.iter().enumerate() {
            assert_eq!(block.id() as usize, index);
        }
    }

    #[test]
    fn ids_past_the_table_are_rejected() {
        assert_eq!(Block::from_u8(3), Some(Block::Dirt));
        assert_eq!(Block::from_u8(65), Some(Block::StoneBrick));
        assert_eq!(Block::from_u8(66), None);
        assert_eq!(Block::from_u8(255), None);
    }
}
