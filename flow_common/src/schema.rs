table! {
    use diesel::sql_types::*;
    use crate::models::sql_types::PipelineState;

    pipelines (name) {
        name -> Text,
        created_at -> Timestamp,
        updated_at -> Timestamp,
        state -> PipelineState,
        spec_commit_id -> Text,
        capability_token -> Text,
        job_counts -> Jsonb,
    }
}

table! {
    use diesel::sql_types::*;
    use crate::models::sql_types::JobState;

    jobs (id) {
        id -> Uuid,
        created_at -> Timestamp,
        updated_at -> Timestamp,
        state -> JobState,
        reason -> Nullable<Text>,
        pipeline_name -> Text,
        output_commit -> Text,
        stats_commit -> Nullable<Text>,
        restart_count -> Int4,
        processed -> Int8,
        skipped -> Int8,
        total -> Int8,
        failed -> Int8,
        stats -> Nullable<Jsonb>,
        capability_token -> Nullable<Text>,
        input_commits -> Jsonb,
    }
}

table! {
    use diesel::sql_types::*;

    control_plane_kv (key) {
        key -> Text,
        value -> Text,
    }
}

table! {
    use diesel::sql_types::*;

    worker_records (id) {
        id -> Uuid,
        created_at -> Timestamp,
        pipeline_rc -> Text,
        job_id -> Nullable<Uuid>,
        kind -> Text,
        data_filters -> Nullable<Jsonb>,
        payload -> Jsonb,
    }
}

joinable!(jobs -> pipelines (pipeline_name));

allow_tables_to_appear_in_same_query!(
    pipelines,
    jobs,
    control_plane_kv,
    worker_records,
);
