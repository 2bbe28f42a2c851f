// Resume optimization: the worker's request pipeline.
// validate → cache lookup → score → store → respond → notify

pub mod handlers;
pub mod pipeline;
