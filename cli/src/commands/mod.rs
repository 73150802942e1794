mod auth;
mod chat;
mod helpers;
mod nutrition;
mod plan;
mod track;

pub(crate) use auth::{cmd_login, cmd_logout};
pub(crate) use chat::cmd_chat;
pub(crate) use helpers::parse_macros_per_100;
pub(crate) use nutrition::{ProfileArgs, cmd_macros, cmd_profile};
pub(crate) use plan::{
    ItemArgs, PlanFields, cmd_plan_add_item, cmd_plan_create, cmd_plan_delete, cmd_plan_list,
    cmd_plan_show, cmd_plan_sync, cmd_plan_update,
};
pub(crate) use track::{
    cmd_track_done, cmd_track_note, cmd_track_notes, cmd_track_show, cmd_track_undo,
};
