pub mod input_task;
pub mod output_task;
pub mod pipeline_task;
