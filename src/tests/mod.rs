mod pipeline_selftest;
