//! Closed enumeration of domain subtypes carried by stack values.
//!
//! Every subtype lives on exactly one primitive stack. Ids fit in 9 bits.

use serde::{Deserialize, Serialize};

use crate::stack::PrimitiveType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Subtype(pub u16);

impl Subtype {
    pub const INT: Self = Self(0);
    pub const BOOLEAN: Self = Self(1);
    pub const COMPONENT: Self = Self(9);
    pub const ENUM: Self = Self(26);
    pub const NPC: Self = Self(32);
    pub const OBJ: Self = Self(33);
    pub const TYPE_35: Self = Self(35);
    pub const STRING: Self = Self(36);
    pub const CLANHASH: Self = Self(49);
    pub const COORDFINE: Self = Self(50);
    pub const CLANFORUMQFC: Self = Self(56);
    pub const HASH64: Self = Self(71);
    pub const STRUCT: Self = Self(73);
    pub const DBROW: Self = Self(74);
    pub const LONG: Self = Self(110);
    pub const TYPE_115: Self = Self(115);
    pub const TYPE_116: Self = Self(116);
    pub const UNKNOWN_INT: Self = Self(501);
    pub const UNKNOWN_LONG: Self = Self(502);
    pub const UNKNOWN_STRING: Self = Self(503);
    pub const SCRIPTREF: Self = Self(504);
    pub const SCRIPTSUBREF: Self = Self(505);

    pub const MAX: u16 = 511;

    const STRING_TYPES: [Subtype; 3] = [Self::STRING, Self::COORDFINE, Self::UNKNOWN_STRING];
    const LONG_TYPES: [Subtype; 8] = [
        Self::TYPE_35,
        Self::CLANHASH,
        Self::CLANFORUMQFC,
        Self::HASH64,
        Self::LONG,
        Self::TYPE_115,
        Self::TYPE_116,
        Self::UNKNOWN_LONG,
    ];

    pub fn primitive(self) -> PrimitiveType {
        if Self::STRING_TYPES.contains(&self) {
            PrimitiveType::String
        } else if Self::LONG_TYPES.contains(&self) {
            PrimitiveType::Long
        } else {
            PrimitiveType::Int
        }
    }

    /// Placeholder subtype for a value whose subtype was never resolved.
    pub fn unknown(p: PrimitiveType) -> Self {
        match p {
            PrimitiveType::Int => Self::UNKNOWN_INT,
            PrimitiveType::Long => Self::UNKNOWN_LONG,
            PrimitiveType::String => Self::UNKNOWN_STRING,
        }
    }

    /// Name of the subtype, `type_<n>` when it has none.
    pub fn name(self) -> String {
        match SUBTYPE_NAMES.iter().find(|(id, _)| *id == self.0) {
            Some((_, name)) => (*name).to_string(),
            None => format!("type_{}", self.0),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        if let Some((id, _)) = SUBTYPE_NAMES.iter().find(|(_, n)| *n == name) {
            return Some(Self(*id));
        }
        let id: u16 = name.strip_prefix("type_")?.parse().ok()?;
        (id <= Self::MAX).then_some(Self(id))
    }

    /// Every subtype with a table entry.
    pub fn all_known() -> impl Iterator<Item = Subtype> {
        SUBTYPE_NAMES.iter().map(|(id, _)| Subtype(*id))
    }
}

impl std::fmt::Display for Subtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

static SUBTYPE_NAMES: &[(u16, &str)] = &[
    (0, "int"),
    (1, "boolean"),
    (2, "type_2"),
    (3, "quest"),
    (4, "questhelp"),
    (5, "cursor"),
    (6, "seq"),
    (7, "colour"),
    (8, "loc_shape"),
    (9, "component"),
    (10, "idkit"),
    (11, "midi"),
    (12, "npc_mode"),
    (13, "namedobj"),
    (14, "synth"),
    (15, "type_15"),
    (16, "area"),
    (17, "stat"),
    (18, "npc_stat"),
    (19, "writeinv"),
    (20, "mesh"),
    (21, "maparea"),
    (22, "coordgrid"),
    (23, "graphic"),
    (24, "chatphrase"),
    (25, "fontmetrics"),
    (26, "enum"),
    (27, "type_27"),
    (28, "jingle"),
    (29, "chatcat"),
    (30, "loc"),
    (31, "model"),
    (32, "npc"),
    (33, "obj"),
    (34, "player_uid"),
    (35, "type_35"),
    (36, "string"),
    (37, "spotanim"),
    (38, "npc_uid"),
    (39, "inv"),
    (40, "texture"),
    (41, "category"),
    (42, "char"),
    (43, "laser"),
    (44, "bas"),
    (45, "type_45"),
    (46, "collision_geometry"),
    (47, "physics_model"),
    (48, "physics_control_modifier"),
    (49, "clanhash"),
    (50, "coordfine"),
    (51, "cutscene"),
    (53, "itemcode"),
    (54, "type_54"),
    (55, "mapsceneicon"),
    (56, "clanforumqfc"),
    (57, "vorbis"),
    (58, "verify_object"),
    (59, "mapelement"),
    (60, "categorytype"),
    (61, "social_network"),
    (62, "hitmark"),
    (63, "package"),
    (64, "particle_effector"),
    (65, "type_65"),
    (66, "particle_emitter"),
    (67, "plogtype"),
    (68, "unsigned_int"),
    (69, "skybox"),
    (70, "skydecor"),
    (71, "hash64"),
    (72, "inputtype"),
    (73, "struct"),
    (74, "dbrow"),
    (75, "type_75"),
    (76, "type_76"),
    (77, "type_77"),
    (78, "type_78"),
    (79, "type_79"),
    (80, "type_80"),
    (81, "type_81"),
    (83, "type_83"),
    (84, "type_84"),
    (85, "type_85"),
    (86, "type_86"),
    (87, "type_87"),
    (88, "type_88"),
    (89, "gwc_platform"),
    (90, "type_90"),
    (91, "type_91"),
    (92, "type_92"),
    (93, "type_93"),
    (94, "bug_template"),
    (95, "billing_auth_flag"),
    (96, "account_feature_flag"),
    (97, "interface"),
    (98, "toplevelinterface"),
    (99, "overlayinterface"),
    (100, "clientinterface"),
    (101, "movespeed"),
    (102, "material"),
    (103, "seqgroup"),
    (104, "temp_hiscore"),
    (105, "temp_hiscore_length_type"),
    (106, "temp_hiscore_display_type"),
    (107, "temp_hiscore_contribute_result"),
    (108, "audiogroup"),
    (109, "audiomixbuss"),
    (110, "long"),
    (111, "crm_channel"),
    (112, "http_image"),
    (113, "pop_up_display_behaviour"),
    (114, "poll"),
    (115, "type_115"),
    (116, "type_116"),
    (117, "pointlight"),
    (118, "player_group"),
    (119, "player_group_status"),
    (120, "player_group_invite_result"),
    (121, "player_group_modify_result"),
    (122, "player_group_join_or_create_result"),
    (123, "player_group_affinity_modify_result"),
    (124, "player_group_delta_type"),
    (125, "client_type"),
    (126, "telemetry_interval"),
    (127, "type_127"),
    (128, "type_128"),
    (129, "type_129"),
    (130, "type_130"),
    (131, "achievement"),
    (133, "stylesheet"),
    (138, "type_138"),
    (200, "type_200"),
    (201, "type_201"),
    (202, "type_202"),
    (203, "type_203"),
    (204, "type_204"),
    (205, "type_205"),
    (206, "type_206"),
    (207, "type_207"),
    (208, "type_208"),
    (209, "var_reference"),
    (501, "unknown_int"),
    (502, "unknown_long"),
    (503, "unknown_string"),
    (504, "scriptref"),
    (505, "scriptsubref"),
];
